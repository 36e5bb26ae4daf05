//! # Hunt Engine
//!
//! The service facade the call-handling layer talks to. Each inbound call
//! gets its own [`RingSessionMachine`] running on a tokio task, so a slow ring
//! in one group never delays another call. The only shared mutable state
//! between sessions is the [`MemberStateTracker`].
//!
//! ```text
//!  call-handling layer ──handle_inbound_call──► HuntEngine ──spawn──► RingSessionMachine
//!        │   ▲                                       │                      │
//!        │   └──────── TelephonyProvider ◄───────────┼──────────────────────┤
//!        │ cancel_call / call_ended                  │                      ▼
//!        └──────────────────────────────────────────►│          MemberStateTracker
//!                                                    ▼                      │
//!                                        StatisticsAggregator ◄── EventBus ◄┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HuntEngineConfig;
use crate::directory::{GroupDirectory, InMemoryGroupDirectory};
use crate::error::{HuntError, Result};
use crate::events::{EventBus, HuntEvent};
use crate::session::{
    ConnectedCalls, RingSessionMachine, SessionContext, SessionOutcome, SessionState,
};
use crate::stats::{GroupDailyStats, StatisticsAggregator};
use crate::telephony::TelephonyProvider;
use crate::tracker::{GroupSnapshot, MemberSnapshot, MemberStateTracker};
use crate::types::{CallId, HuntGroupId, InboundCall, MemberId};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveSession {
    group_id: HuntGroupId,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

/// Handle to a running ring session
pub struct SessionHandle {
    call_id: CallId,
    state: watch::Receiver<SessionState>,
    join: JoinHandle<Result<SessionOutcome>>,
}

impl SessionHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Current state of the session
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch receiver for state changes
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches a state matching `predicate`
    pub async fn wait_for_state(&mut self, predicate: impl FnMut(&SessionState) -> bool) -> Result<SessionState> {
        self.state
            .wait_for(predicate)
            .await
            .map(|s| s.clone())
            .map_err(|_| HuntError::internal(format!("session {} ended before reaching the state", self.call_id)))
    }

    /// Wait for the session to finish
    pub async fn outcome(self) -> Result<SessionOutcome> {
        self.join
            .await
            .map_err(|e| HuntError::internal(format!("session task for {} failed: {}", self.call_id, e)))?
    }
}

/// Releases connected calls once they end, after the group's wrap-up time
#[derive(Clone)]
struct CallCompletion {
    tracker: Arc<MemberStateTracker>,
    connected: Arc<ConnectedCalls>,
    shutdown: CancellationToken,
}

impl CallCompletion {
    fn call_ended(&self, call_id: &CallId) -> Result<()> {
        let (_, call) = self
            .connected
            .remove(call_id)
            .ok_or_else(|| HuntError::not_found("connected call", call_id.as_str()))?;

        if call.wrap_up.is_zero() {
            info!("📴 Call {} ended, releasing {}", call_id, call.member_id);
            return self.tracker.release(&call.member_id);
        }

        self.tracker.begin_wrap_up(&call.member_id)?;
        info!(
            "📴 Call {} ended, {} in wrap-up for {:?}",
            call_id, call.member_id, call.wrap_up
        );

        let tracker = Arc::clone(&self.tracker);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(call.wrap_up) => {}
                _ = shutdown.cancelled() => {
                    debug!("Wrap-up for {} cut short by shutdown", call.member_id);
                }
            }
            match tracker.finish_wrap_up(&call.member_id) {
                Ok(()) => debug!("Wrap-up finished for {}", call.member_id),
                Err(e) => error!("🚨 Failed to finish wrap-up for {}: {}", call.member_id, e),
            }
        });
        Ok(())
    }
}

/// Automatic call distribution engine for hunt groups
pub struct HuntEngine {
    config: HuntEngineConfig,
    directory: Arc<dyn GroupDirectory>,
    tracker: Arc<MemberStateTracker>,
    telephony: Arc<dyn TelephonyProvider>,
    events: EventBus,
    stats: Arc<StatisticsAggregator>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    stats_shutdown: CancellationToken,
    sessions: Arc<DashMap<CallId, ActiveSession>>,
    completion: CallCompletion,
    shutdown: CancellationToken,
}

impl HuntEngine {
    /// Create an engine reading groups from `directory`
    ///
    /// Must be called inside a tokio runtime; the statistics consumer is
    /// spawned immediately.
    pub async fn new(
        config: HuntEngineConfig,
        directory: Arc<dyn GroupDirectory>,
        telephony: Arc<dyn TelephonyProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new();
        let tracker = Arc::new(MemberStateTracker::with_initial_availability(
            events.clone(),
            config.general.members_start_available,
        ));
        let stats = Arc::new(StatisticsAggregator::new(config.statistics.reorder_window));
        let stats_shutdown = CancellationToken::new();
        let stats_task = Arc::clone(&stats).spawn_consumer(events.subscribe(), stats_shutdown.clone());
        let shutdown = CancellationToken::new();

        let completion = CallCompletion {
            tracker: Arc::clone(&tracker),
            connected: Arc::new(ConnectedCalls::new()),
            shutdown: shutdown.clone(),
        };

        info!("🚀 Hunt engine started");
        Ok(Self {
            config,
            directory,
            tracker,
            telephony,
            events,
            stats,
            stats_task: Mutex::new(Some(stats_task)),
            stats_shutdown,
            sessions: Arc::new(DashMap::new()),
            completion,
            shutdown,
        })
    }

    /// Create an engine whose directory is seeded from `config.groups`
    pub async fn from_config(config: HuntEngineConfig, telephony: Arc<dyn TelephonyProvider>) -> Result<Self> {
        let directory = Arc::new(InMemoryGroupDirectory::from_definitions(&config.groups)?);
        let group_ids = directory.group_ids();
        let engine = Self::new(config, directory, telephony).await?;
        for group_id in group_ids {
            engine.load_group(&group_id).await?;
        }
        Ok(engine)
    }

    pub fn config(&self) -> &HuntEngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<MemberStateTracker> {
        &self.tracker
    }

    pub fn statistics(&self) -> &Arc<StatisticsAggregator> {
        &self.stats
    }

    /// Additional consumer of the engine's event stream
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<HuntEvent> {
        self.events.subscribe()
    }

    /// Load or reload a group's roster from the directory
    ///
    /// Runtime state of members present before and after is preserved.
    pub async fn load_group(&self, group_id: &HuntGroupId) -> Result<()> {
        let group = self.directory.get_hunt_group(group_id).await?;
        let members = self.directory.get_members(group_id).await?;
        group.validate()?;
        group.validate_members(&members)?;
        self.tracker.load_roster(group_id, members)
    }

    /// Forget a group's roster
    pub fn unload_group(&self, group_id: &HuntGroupId) {
        self.tracker.remove_group(group_id);
        info!("Hunt group {} unloaded", group_id);
    }

    /// Start hunting for an inbound call
    pub async fn handle_inbound_call(&self, call: InboundCall) -> Result<SessionHandle> {
        if self.shutdown.is_cancelled() {
            return Err(HuntError::internal("hunt engine is shut down"));
        }
        if self.sessions.contains_key(&call.call_id) || self.completion.connected.contains_key(&call.call_id) {
            return Err(HuntError::invariant(format!("call {} is already being handled", call.call_id)));
        }

        let group = self.directory.get_hunt_group(&call.group_id).await?;
        group.validate()?;
        if !self.tracker.has_group(&group.id) {
            self.load_group(&group.id).await?;
        }

        let cancel = self.shutdown.child_token();
        let machine = RingSessionMachine::new(&call, group, self.session_context(), cancel.clone());
        let state = machine.subscribe();

        // the directory lookups above yield, so a duplicate may have slipped in since the first check
        match self.sessions.entry(call.call_id.clone()) {
            Entry::Occupied(_) => {
                return Err(HuntError::invariant(format!("call {} is already being handled", call.call_id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveSession {
                    group_id: call.group_id.clone(),
                    cancel: cancel.clone(),
                    state: state.clone(),
                });
            }
        }

        let sessions = Arc::clone(&self.sessions);
        let completion = self.completion.clone();
        let call_id = call.call_id.clone();
        let join = tokio::spawn(async move {
            let result = machine.run().await;
            sessions.remove(&call_id);

            // a hang-up that raced with the answer is a normal call end
            if cancel.is_cancelled() {
                if let Ok(SessionOutcome::Connected { .. }) = &result {
                    if let Err(e) = completion.call_ended(&call_id) {
                        warn!("Failed to end call {} after late hang-up: {}", call_id, e);
                    }
                }
            }
            result
        });

        Ok(SessionHandle {
            call_id: call.call_id,
            state,
            join,
        })
    }

    /// The caller hung up
    ///
    /// While hunting this cancels the session, which releases any held
    /// reservation exactly once. After the call was answered it is treated
    /// as the end of the call.
    pub fn cancel_call(&self, call_id: &CallId) -> Result<()> {
        if self.completion.connected.contains_key(call_id) {
            return self.completion.call_ended(call_id);
        }
        match self.sessions.get(call_id) {
            Some(session) => {
                info!("Cancelling hunt for call {} in group {}", call_id, session.group_id);
                session.cancel.cancel();
                Ok(())
            }
            None => Err(HuntError::not_found("call", call_id.as_str())),
        }
    }

    /// An answered call was torn down; wrap-up starts now
    pub fn call_ended(&self, call_id: &CallId) -> Result<()> {
        self.completion.call_ended(call_id)
    }

    pub fn set_member_availability(&self, member_id: &MemberId, available: bool) -> Result<()> {
        self.tracker.set_availability(member_id, available)
    }

    pub fn member_state(&self, member_id: &MemberId) -> Result<MemberSnapshot> {
        self.tracker.member_state(member_id)
    }

    pub fn group_snapshot(&self, group_id: &HuntGroupId) -> Result<GroupSnapshot> {
        self.tracker.snapshot(group_id)
    }

    /// Zero daily per-member counters and purge statistics past retention
    ///
    /// Invoked by the daily rollover job.
    pub fn reset_daily_counters(&self) {
        self.tracker.reset_daily_counters();
        let retention = chrono::Days::new(u64::from(self.config.statistics.retention_days));
        if let Some(cutoff) = chrono::Utc::now().date_naive().checked_sub_days(retention) {
            self.stats.purge_before(cutoff);
        }
    }

    /// Today's statistics for a group
    pub fn stats(&self, group_id: &HuntGroupId) -> GroupDailyStats {
        self.stats.today(group_id)
    }

    /// Statistics for a group on a given UTC day
    pub fn stats_for(&self, group_id: &HuntGroupId, day: NaiveDate) -> Option<GroupDailyStats> {
        self.stats.group_stats(group_id, day)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connected_call_count(&self) -> usize {
        self.completion.connected.len()
    }

    pub fn session_state(&self, call_id: &CallId) -> Option<SessionState> {
        self.sessions.get(call_id).map(|s| s.state.borrow().clone())
    }

    /// Cancel every session and wait for them to wind down
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 Shutting down hunt engine ({} active sessions)", self.sessions.len());
        self.shutdown.cancel();

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while !self.sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        // sessions have published their final events; let the consumer apply them
        self.stats_shutdown.cancel();
        let stats_task = self.stats_task.lock().take();
        if let Some(task) = stats_task {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("Statistics consumer drained"),
                Ok(Err(e)) => error!("🚨 Statistics consumer failed: {}", e),
                Err(_) => warn!("Statistics consumer still running after {:?}", SHUTDOWN_TIMEOUT),
            }
        }

        match drained {
            Ok(()) => {
                info!("✅ Hunt engine stopped");
                Ok(())
            }
            Err(_) => Err(HuntError::internal(format!(
                "{} sessions still running after {:?}",
                self.sessions.len(),
                SHUTDOWN_TIMEOUT
            ))),
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            tracker: Arc::clone(&self.tracker),
            telephony: Arc::clone(&self.telephony),
            events: self.events.clone(),
            connected: Arc::clone(&self.completion.connected),
            settings: self.config.session_settings(),
        }
    }
}

impl Drop for HuntEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.stats_shutdown.cancel();
    }
}
