//! # Ring Session Machine
//!
//! One [`RingSessionMachine`] drives one inbound call from arrival to a
//! terminal state. Transitions within a session are strictly sequential:
//!
//! ```text
//!        ┌──────────────┐  empty, nothing tried / inactive group
//!   ┌───►│ Dispatching  │─────────────────────────────┐
//!   │    └──────┬───────┘                             │
//!   │           │ reserved                            │
//!   │    ┌──────▼───────┐                             │
//!   │    │   Ringing    │                             │
//!   │    └──┬───────┬───┘                             │
//!   │ busy/ │       │ answered                 ┌──────▼──────┐
//!   │ no    │  ┌────▼──────┐                   │ Escalating  │
//!   │ answer│  │ Connected │                   └──────┬──────┘
//!   │       │  └────┬──────┘                          │
//!   └───────┘       ▼                                 ▼
//!          Terminal(Completed)              Terminal(Escalated)
//! ```
//!
//! A cycle ends when the resolver has nobody left to try. The session then
//! either starts the next cycle or escalates once `max_cycles` is exceeded.
//!
//! Caller hang-up is delivered through a [`CancellationToken`] and wins over
//! any pending ring outcome. A held reservation is released on every exit
//! path: immediately on busy/no-answer/cancel, after wrap-up for connected
//! calls (handled by the engine), and as a safety net when the session fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{HuntError, Result};
use crate::escalation::{EscalationReason, EscalationRouter, RedirectInstruction};
use crate::events::{EventBus, HuntEvent, HuntEventKind, RingAttemptOutcome, TerminalKind};
use crate::resolver::HuntStrategyResolver;
use crate::telephony::{RingOutcome, TelephonyProvider};
use crate::tracker::MemberStateTracker;
use crate::types::{CallId, HuntGroup, HuntGroupId, InboundCall, Member, MemberId};

/// Where a session currently is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Dispatching,
    Ringing { member_id: MemberId },
    Connected { member_id: MemberId },
    NoAnswer { member_id: MemberId },
    Busy { member_id: MemberId },
    Escalating,
    Terminal { terminal: TerminalState },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminal { .. })
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// A member answered
    Completed,
    /// The caller was redirected to the no-answer destination
    Escalated,
    /// The caller hung up first
    Abandoned,
    /// Configuration or telephony failure
    Failed,
}

impl From<TerminalState> for TerminalKind {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Completed => TerminalKind::Completed,
            TerminalState::Escalated => TerminalKind::Escalated,
            TerminalState::Abandoned => TerminalKind::Abandoned,
            TerminalState::Failed => TerminalKind::Failed,
        }
    }
}

/// Per-call hunting state
#[derive(Debug, Clone)]
pub struct RingSession {
    pub call_id: CallId,
    pub hunt_group_id: HuntGroupId,
    /// Current cycle, starting at 1
    pub cycle_count: u32,
    /// Members tried in the current cycle, in order
    pub attempted_member_ids: Vec<MemberId>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub required_skill: Option<String>,
    /// Circular hunting starts after this member; fixed for the whole call
    pub rotation_anchor: Option<MemberId>,
    /// Ring attempts made so far across all cycles
    pub ring_attempts: u32,
    sequence: u64,
}

impl RingSession {
    pub fn new(call: &InboundCall, rotation_anchor: Option<MemberId>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            hunt_group_id: call.group_id.clone(),
            cycle_count: 1,
            attempted_member_ids: Vec::new(),
            state: SessionState::Dispatching,
            started_at: Utc::now(),
            required_skill: call.required_skill.clone(),
            rotation_anchor,
            ring_attempts: 0,
            sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// One offer to one member
#[derive(Debug, Clone)]
pub struct RingAttempt {
    pub member: Member,
    pub deadline: Instant,
    pub deadline_at: DateTime<Utc>,
    pub cycle: u32,
}

/// Deadline used when `now + timeout` does not fit in an [`Instant`]
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

impl RingAttempt {
    fn new(member: Member, timeout: Duration, cycle: u32) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        let deadline_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            member,
            deadline,
            deadline_at,
            cycle,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Final result of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Connected {
        call_id: CallId,
        group_id: HuntGroupId,
        member_id: MemberId,
        extension: String,
    },
    Escalated {
        instruction: RedirectInstruction,
        reason: EscalationReason,
    },
    Abandoned,
}

/// A connected call still holding its member's reservation
#[derive(Debug, Clone)]
pub struct ConnectedCall {
    pub call_id: CallId,
    pub group_id: HuntGroupId,
    pub member_id: MemberId,
    pub wrap_up: Duration,
    pub connected_at: DateTime<Utc>,
}

/// Calls that were answered and have not ended yet
pub type ConnectedCalls = DashMap<CallId, ConnectedCall>;

/// Tunables for ring sessions
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Immediate retries after a telephony failure before treating it as no answer
    pub telephony_retry_attempts: u32,
    /// Consecutive reservation races tolerated in one dispatch
    pub max_reservation_retries: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            telephony_retry_attempts: 1,
            max_reservation_retries: 8,
        }
    }
}

/// Collaborators shared by all sessions
#[derive(Clone)]
pub struct SessionContext {
    pub tracker: Arc<MemberStateTracker>,
    pub telephony: Arc<dyn TelephonyProvider>,
    pub events: EventBus,
    pub connected: Arc<ConnectedCalls>,
    pub settings: SessionSettings,
}

enum Dispatch {
    Reserved(Member),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingResolution {
    Answered,
    Busy,
    NoAnswer,
    Failed,
    Cancelled,
}

impl From<RingResolution> for RingAttemptOutcome {
    fn from(resolution: RingResolution) -> Self {
        match resolution {
            RingResolution::Answered => RingAttemptOutcome::Answered,
            RingResolution::Busy => RingAttemptOutcome::Busy,
            RingResolution::NoAnswer => RingAttemptOutcome::NoAnswer,
            RingResolution::Failed => RingAttemptOutcome::Failed,
            RingResolution::Cancelled => RingAttemptOutcome::Cancelled,
        }
    }
}

/// State machine hunting one inbound call
pub struct RingSessionMachine {
    session: RingSession,
    group: HuntGroup,
    ctx: SessionContext,
    cancel: CancellationToken,
    state_tx: watch::Sender<SessionState>,
    held: Option<MemberId>,
    started: Instant,
}

impl RingSessionMachine {
    pub fn new(call: &InboundCall, group: HuntGroup, ctx: SessionContext, cancel: CancellationToken) -> Self {
        let anchor = ctx.tracker.last_offered(&group.id);
        let session = RingSession::new(call, anchor);
        let (state_tx, _) = watch::channel(SessionState::Dispatching);
        Self {
            session,
            group,
            ctx,
            cancel,
            state_tx,
            held: None,
            started: Instant::now(),
        }
    }

    /// Watch the session's state as it progresses
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn session(&self) -> &RingSession {
        &self.session
    }

    /// Hunt until a terminal state is reached
    pub async fn run(mut self) -> Result<SessionOutcome> {
        let span = info_span!(
            "hunt_session",
            call_id = %self.session.call_id,
            group_id = %self.group.id
        );

        async move {
            let result = self.drive().await;

            if let Some(member_id) = self.held.take() {
                warn!("Session ended while holding member {}, releasing", member_id);
                if let Err(e) = self.ctx.tracker.release(&member_id) {
                    error!("🚨 Failed to release member {}: {}", member_id, e);
                }
            }

            if let Err(e) = &result {
                error!("❌ Hunt failed for call {}: {}", self.session.call_id, e);
                if !self.session.state.is_terminal() {
                    self.terminate(TerminalState::Failed, None, None, None);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> Result<SessionOutcome> {
        info!(
            "📞 Hunting call {} in group {} ({}, {} cycle(s), {}s ring timeout)",
            self.session.call_id,
            self.group.id,
            self.group.hunt_type,
            self.group.max_cycles,
            self.group.ring_timeout_seconds
        );

        if !self.group.is_active {
            info!("Hunt group {} is inactive, escalating", self.group.id);
            return self.escalate(EscalationReason::GroupInactive).await;
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.abandon();
            }
            self.transition(SessionState::Dispatching);

            let member = match self.dispatch()? {
                Dispatch::Reserved(member) => member,
                Dispatch::Exhausted if self.session.attempted_member_ids.is_empty() => {
                    return self.escalate(EscalationReason::NoCandidateAvailable).await;
                }
                Dispatch::Exhausted => {
                    if !self.complete_cycle() {
                        return self.escalate(EscalationReason::CyclesExhausted).await;
                    }
                    continue;
                }
            };

            match self.ring(&member).await? {
                RingResolution::Answered => return self.connect(member),
                RingResolution::Cancelled => {
                    let outcome = self.abandon();
                    self.stop_ringing(&member);
                    return outcome;
                }
                RingResolution::Busy => {
                    self.transition(SessionState::Busy {
                        member_id: member.member_id.clone(),
                    });
                    self.unanswered(member)?;
                }
                RingResolution::NoAnswer | RingResolution::Failed => {
                    self.transition(SessionState::NoAnswer {
                        member_id: member.member_id.clone(),
                    });
                    self.unanswered(member)?;
                }
            }
        }
    }

    /// Pick and reserve the next member
    ///
    /// A failed reservation means the member changed between snapshot and
    /// reserve; the dispatch starts over from a fresh snapshot.
    fn dispatch(&mut self) -> Result<Dispatch> {
        for race in 0..=self.ctx.settings.max_reservation_retries {
            let snapshot = self.ctx.tracker.snapshot(&self.group.id)?;
            let candidates = HuntStrategyResolver::next_candidates(&self.group, &snapshot, &self.session);
            let Some(member) = candidates.into_iter().next() else {
                return Ok(Dispatch::Exhausted);
            };

            if self.ctx.tracker.reserve(&member.member_id)? {
                debug!("Reserved member {} for call {}", member.member_id, self.session.call_id);
                self.held = Some(member.member_id.clone());
                return Ok(Dispatch::Reserved(member));
            }
            debug!(
                "Reservation race on member {} for call {} (race {})",
                member.member_id, self.session.call_id, race
            );
        }

        warn!(
            "Giving up dispatch for call {} after {} reservation races",
            self.session.call_id,
            self.ctx.settings.max_reservation_retries + 1
        );
        Ok(Dispatch::Exhausted)
    }

    async fn ring(&mut self, member: &Member) -> Result<RingResolution> {
        let attempt = RingAttempt::new(member.clone(), self.group.ring_timeout(), self.session.cycle_count);
        self.session.ring_attempts += 1;
        self.ctx.tracker.mark_offered(&member.member_id)?;

        self.transition(SessionState::Ringing {
            member_id: member.member_id.clone(),
        });
        self.publish(HuntEventKind::RingAttemptStarted {
            member_id: member.member_id.clone(),
            extension: member.extension.clone(),
            cycle: attempt.cycle,
            deadline: attempt.deadline_at,
        });
        info!(
            "🔔 Ringing {} ({}) for call {}, cycle {}",
            member.member_id, member.extension, self.session.call_id, attempt.cycle
        );

        let resolution = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => RingResolution::Cancelled,
            resolution = ring_with_retry(
                self.ctx.telephony.as_ref(),
                &self.session.call_id,
                &attempt,
                self.ctx.settings.telephony_retry_attempts,
            ) => resolution,
        };

        debug!("Ring attempt on {} resolved: {:?}", member.member_id, resolution);
        self.publish(HuntEventKind::RingAttemptResolved {
            member_id: member.member_id.clone(),
            outcome: resolution.into(),
        });
        Ok(resolution)
    }

    /// Ask the provider to stop ringing once the session has already let go
    fn stop_ringing(&self, member: &Member) {
        let telephony = Arc::clone(&self.ctx.telephony);
        let call_id = self.session.call_id.clone();
        let extension = member.extension.clone();
        tokio::spawn(
            async move {
                if let Err(e) = telephony.stop_ringing(&call_id, &extension).await {
                    warn!("Failed to stop ringing {}: {}", extension, e);
                }
            }
            .in_current_span(),
        );
    }

    fn unanswered(&mut self, member: Member) -> Result<()> {
        self.release_held()?;
        self.session.attempted_member_ids.push(member.member_id);
        Ok(())
    }

    /// Close the current cycle; `false` once the cycle budget is spent
    fn complete_cycle(&mut self) -> bool {
        self.session.cycle_count += 1;
        if self.session.cycle_count > self.group.max_cycles {
            info!(
                "All {} cycle(s) exhausted for call {}",
                self.group.max_cycles, self.session.call_id
            );
            return false;
        }
        debug!(
            "Starting cycle {} for call {}",
            self.session.cycle_count, self.session.call_id
        );
        self.session.attempted_member_ids.clear();
        true
    }

    fn connect(&mut self, member: Member) -> Result<SessionOutcome> {
        let member_id = self
            .held
            .clone()
            .ok_or_else(|| HuntError::invariant(format!("call {} connected without a reservation", self.session.call_id)))?;
        self.ctx.tracker.record_connected(&member_id)?;

        // the reservation now belongs to the connected call until wrap-up ends
        self.held = None;
        self.ctx.connected.insert(
            self.session.call_id.clone(),
            ConnectedCall {
                call_id: self.session.call_id.clone(),
                group_id: self.group.id.clone(),
                member_id: member_id.clone(),
                wrap_up: self.group.wrap_up(),
                connected_at: Utc::now(),
            },
        );

        self.transition(SessionState::Connected {
            member_id: member_id.clone(),
        });
        info!("✅ Call {} answered by {}", self.session.call_id, member_id);
        self.terminate(TerminalState::Completed, Some(member_id.clone()), None, None);

        Ok(SessionOutcome::Connected {
            call_id: self.session.call_id.clone(),
            group_id: self.group.id.clone(),
            member_id,
            extension: member.extension,
        })
    }

    fn abandon(&mut self) -> Result<SessionOutcome> {
        self.release_held()?;
        info!("📴 Caller hung up on call {} while hunting", self.session.call_id);
        self.terminate(TerminalState::Abandoned, None, None, None);
        Ok(SessionOutcome::Abandoned)
    }

    async fn escalate(&mut self, reason: EscalationReason) -> Result<SessionOutcome> {
        self.transition(SessionState::Escalating);
        let instruction =
            EscalationRouter::resolve(self.group.no_answer_destination, self.group.no_answer_target.as_deref())?;
        info!(
            "↪️ Escalating call {} ({:?}) to {:?}",
            self.session.call_id, reason, instruction
        );

        let redirected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = redirect_with_retry(
                self.ctx.telephony.as_ref(),
                &self.session.call_id,
                &instruction,
                self.ctx.settings.telephony_retry_attempts,
            ) => Some(result),
        };
        match redirected {
            None => return self.abandon(),
            Some(result) => result?,
        }

        self.terminate(TerminalState::Escalated, None, Some(instruction.clone()), Some(reason));
        Ok(SessionOutcome::Escalated { instruction, reason })
    }

    fn release_held(&mut self) -> Result<()> {
        match self.held.take() {
            Some(member_id) => self.ctx.tracker.release(&member_id),
            None => Ok(()),
        }
    }

    fn terminate(
        &mut self,
        terminal: TerminalState,
        answered_by: Option<MemberId>,
        redirect: Option<RedirectInstruction>,
        escalation_reason: Option<EscalationReason>,
    ) {
        let wait_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.publish(HuntEventKind::SessionTerminated {
            terminal: terminal.into(),
            wait_ms,
            ring_attempts: self.session.ring_attempts,
            answered_by,
            redirect,
            escalation_reason,
        });
        self.transition(SessionState::Terminal { terminal });
    }

    fn transition(&mut self, state: SessionState) {
        debug!("Call {}: {:?} -> {:?}", self.session.call_id, self.session.state, state);
        self.session.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn publish(&mut self, kind: HuntEventKind) {
        let sequence = self.session.next_sequence();
        self.ctx.events.publish(HuntEvent::new(
            Some(self.session.call_id.clone()),
            self.group.id.clone(),
            sequence,
            kind,
        ));
    }
}

async fn ring_with_retry(
    telephony: &dyn TelephonyProvider,
    call_id: &CallId,
    attempt: &RingAttempt,
    retries: u32,
) -> RingResolution {
    let mut failures = 0;
    loop {
        let ring = telephony.ring(call_id, &attempt.member.extension, attempt.remaining());
        match tokio::time::timeout_at(attempt.deadline, ring).await {
            Err(_) => return RingResolution::NoAnswer,
            Ok(Ok(RingOutcome::Answered)) => return RingResolution::Answered,
            Ok(Ok(RingOutcome::Busy | RingOutcome::Rejected)) => return RingResolution::Busy,
            Ok(Ok(RingOutcome::NoAnswer)) => return RingResolution::NoAnswer,
            Ok(Err(e)) => {
                failures += 1;
                if failures > retries {
                    warn!(
                        "Ring to {} failed {} time(s), treating as no answer: {}",
                        attempt.member.extension, failures, e
                    );
                    return RingResolution::Failed;
                }
                warn!("Ring to {} failed, retrying: {}", attempt.member.extension, e);
            }
        }
    }
}

async fn redirect_with_retry(
    telephony: &dyn TelephonyProvider,
    call_id: &CallId,
    instruction: &RedirectInstruction,
    retries: u32,
) -> Result<()> {
    let mut failures = 0;
    loop {
        match telephony.redirect(call_id, instruction).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                failures += 1;
                if failures > retries {
                    return Err(HuntError::telephony(format!(
                        "redirect of call {} failed after {} attempt(s): {}",
                        call_id, failures, e
                    )));
                }
                warn!("Redirect of call {} failed, retrying: {}", call_id, e);
            }
        }
    }
}
