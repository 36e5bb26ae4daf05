//! Statistics aggregation
//!
//! Folds the hunt event stream into per-group, per-day metrics. Delivery may
//! be reordered within a bounded window: each stream (a call, or a member's
//! presence changes) remembers which sequence numbers it has applied, so
//! duplicates and events older than the window are ignored.
//!
//! Windows are stamped with the last day they saw an event and are dropped
//! together with that day's metrics by [`StatisticsAggregator::purge_before`].
//! Events dated before the purge floor are ignored from then on.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{HuntEvent, HuntEventKind, RingAttemptOutcome, StreamKey, TerminalKind};
use crate::types::{HuntGroupId, MemberId};

/// Daily metrics for one hunt group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDailyStats {
    /// Sessions that reached a terminal state
    pub total_sessions: u64,
    /// Sessions answered by a member
    pub calls_handled: u64,
    pub calls_escalated: u64,
    pub calls_abandoned: u64,
    pub calls_failed: u64,
    pub ring_attempts: u64,
    pub no_answers: u64,
    pub busies: u64,
    /// Sum of wait for handled and escalated sessions
    pub total_wait_ms: u64,
    /// Number of sessions contributing to `total_wait_ms`
    pub waited_sessions: u64,
    pub members: HashMap<MemberId, MemberDailyStats>,
}

impl GroupDailyStats {
    /// Mean time from first dispatch to connect or escalation
    pub fn average_wait(&self) -> Option<Duration> {
        if self.waited_sessions == 0 {
            return None;
        }
        Some(Duration::from_millis(self.total_wait_ms / self.waited_sessions))
    }

    /// Share of sessions that ended with the caller hanging up
    pub fn abandon_rate(&self) -> f64 {
        if self.total_sessions == 0 {
            return 0.0;
        }
        self.calls_abandoned as f64 / self.total_sessions as f64
    }
}

/// Daily metrics for one member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDailyStats {
    pub offered: u64,
    pub answered: u64,
    pub state_changes: u64,
}

#[derive(Debug, Default)]
struct SequenceWindow {
    highest: u64,
    applied: BTreeSet<u64>,
    last_day: Option<NaiveDate>,
}

impl SequenceWindow {
    /// Record `sequence`; `false` if it is a duplicate or fell out of the window
    fn admit(&mut self, sequence: u64, window: u64) -> bool {
        if sequence.saturating_add(window) <= self.highest {
            return false;
        }
        if !self.applied.insert(sequence) {
            return false;
        }
        if sequence > self.highest {
            self.highest = sequence;
            let floor = self.highest.saturating_sub(window);
            self.applied = self.applied.split_off(&floor);
        }
        true
    }
}

#[derive(Default)]
struct AggregatorState {
    groups: HashMap<(HuntGroupId, NaiveDate), GroupDailyStats>,
    windows: HashMap<StreamKey, SequenceWindow>,
    purged_before: Option<NaiveDate>,
    ignored: u64,
}

/// Per-group, per-day statistics built from hunt events
pub struct StatisticsAggregator {
    state: RwLock<AggregatorState>,
    reorder_window: u64,
}

impl StatisticsAggregator {
    pub fn new(reorder_window: u64) -> Self {
        Self {
            state: RwLock::new(AggregatorState::default()),
            reorder_window: reorder_window.max(1),
        }
    }

    /// Apply one event; returns `false` when it was ignored as late or duplicate
    pub fn ingest(&self, event: &HuntEvent) -> bool {
        let mut state = self.state.write();
        let day = event.timestamp.date_naive();

        if state.purged_before.is_some_and(|floor| day < floor) {
            state.ignored += 1;
            debug!("Ignoring event {:?} from purged day {}", event.stream_key(), day);
            return false;
        }

        let window = state.windows.entry(event.stream_key()).or_default();
        if !window.admit(event.sequence, self.reorder_window) {
            state.ignored += 1;
            debug!(
                "Ignoring late or duplicate event {:?} seq {}",
                event.stream_key(),
                event.sequence
            );
            return false;
        }
        if window.last_day.map_or(true, |last| last < day) {
            window.last_day = Some(day);
        }

        let stats = state.groups.entry((event.group_id.clone(), day)).or_default();

        match &event.kind {
            HuntEventKind::MemberStateChanged { member_id, .. } => {
                stats.members.entry(member_id.clone()).or_default().state_changes += 1;
            }
            HuntEventKind::RingAttemptStarted { member_id, .. } => {
                stats.ring_attempts += 1;
                stats.members.entry(member_id.clone()).or_default().offered += 1;
            }
            HuntEventKind::RingAttemptResolved { member_id, outcome } => match outcome {
                RingAttemptOutcome::Answered => {
                    stats.members.entry(member_id.clone()).or_default().answered += 1;
                }
                RingAttemptOutcome::Busy => stats.busies += 1,
                RingAttemptOutcome::NoAnswer | RingAttemptOutcome::Failed => stats.no_answers += 1,
                RingAttemptOutcome::Cancelled => {}
            },
            HuntEventKind::SessionTerminated { terminal, wait_ms, .. } => {
                stats.total_sessions += 1;
                match terminal {
                    TerminalKind::Completed => {
                        stats.calls_handled += 1;
                        stats.total_wait_ms += wait_ms;
                        stats.waited_sessions += 1;
                    }
                    TerminalKind::Escalated => {
                        stats.calls_escalated += 1;
                        stats.total_wait_ms += wait_ms;
                        stats.waited_sessions += 1;
                    }
                    TerminalKind::Abandoned => stats.calls_abandoned += 1,
                    TerminalKind::Failed => stats.calls_failed += 1,
                }
            }
        }
        true
    }

    /// Stats for a group on a given UTC day
    pub fn group_stats(&self, group_id: &HuntGroupId, day: NaiveDate) -> Option<GroupDailyStats> {
        self.state.read().groups.get(&(group_id.clone(), day)).cloned()
    }

    /// Stats for a group today (UTC)
    pub fn today(&self, group_id: &HuntGroupId) -> GroupDailyStats {
        self.group_stats(group_id, chrono::Utc::now().date_naive())
            .unwrap_or_default()
    }

    /// Number of events dropped as late or duplicate
    pub fn ignored_events(&self) -> u64 {
        self.state.read().ignored
    }

    /// Number of event streams with a live sequence window
    pub fn tracked_streams(&self) -> usize {
        self.state.read().windows.len()
    }

    /// Forget everything recorded before `day`
    ///
    /// Sequence windows whose last event is older than `day` go too, so the
    /// aggregator does not grow with every call it has ever seen.
    pub fn purge_before(&self, day: NaiveDate) {
        let mut state = self.state.write();
        state.groups.retain(|(_, d), _| *d >= day);
        let before = state.windows.len();
        state.windows.retain(|_, w| w.last_day.is_some_and(|last| last >= day));
        if state.purged_before.map_or(true, |floor| floor < day) {
            state.purged_before = Some(day);
        }
        debug!(
            "Purged statistics before {}, dropped {} sequence windows",
            day,
            before - state.windows.len()
        );
    }

    /// Consume an event stream until its sender side closes or `shutdown` fires
    ///
    /// On shutdown the events already queued are applied before the task ends.
    pub fn spawn_consumer(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<HuntEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => {
                            self.ingest(&event);
                        }
                        None => break,
                    },
                    _ = shutdown.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            self.ingest(&event);
                        }
                        break;
                    }
                }
            }
            info!("📊 Statistics consumer stopped");
        })
    }
}

impl Default for StatisticsAggregator {
    fn default() -> Self {
        Self::new(64)
    }
}
