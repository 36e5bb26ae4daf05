//! Hunt engine events
//!
//! Every state change in the engine is published as a [`HuntEvent`]. Events
//! belonging to one call carry a per-call sequence number; member events that
//! are not tied to a call are sequenced by the member's version counter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::escalation::{EscalationReason, RedirectInstruction};
use crate::types::{CallId, HuntGroupId, MemberId};

/// Envelope shared by all events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntEvent {
    /// Call that caused the event, `None` for member presence changes
    pub call_id: Option<CallId>,
    pub group_id: HuntGroupId,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub kind: HuntEventKind,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HuntEventKind {
    MemberStateChanged {
        member_id: MemberId,
        change: MemberChange,
        is_available: bool,
        current_calls: u32,
        in_wrap_up: bool,
    },
    RingAttemptStarted {
        member_id: MemberId,
        extension: String,
        cycle: u32,
        deadline: DateTime<Utc>,
    },
    RingAttemptResolved {
        member_id: MemberId,
        outcome: RingAttemptOutcome,
    },
    SessionTerminated {
        terminal: TerminalKind,
        /// Time from first dispatch to connect or escalation
        wait_ms: u64,
        ring_attempts: u32,
        answered_by: Option<MemberId>,
        redirect: Option<RedirectInstruction>,
        escalation_reason: Option<EscalationReason>,
    },
}

/// What happened to a member's runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberChange {
    Reserved,
    Released,
    AvailabilityChanged,
    Offered,
    Connected,
    WrapUpStarted,
    WrapUpFinished,
    DailyReset,
}

/// Resolution of a single ring attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingAttemptOutcome {
    Answered,
    Busy,
    NoAnswer,
    /// The telephony provider failed and the retry failed too
    Failed,
    /// The caller hung up while the member was ringing
    Cancelled,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Completed,
    Escalated,
    Abandoned,
    Failed,
}

impl HuntEvent {
    pub fn new(call_id: Option<CallId>, group_id: HuntGroupId, sequence: u64, kind: HuntEventKind) -> Self {
        Self {
            call_id,
            group_id,
            timestamp: Utc::now(),
            sequence,
            kind,
        }
    }

    /// Stream this event is sequenced within
    pub fn stream_key(&self) -> StreamKey {
        match (&self.call_id, &self.kind) {
            (Some(call_id), _) => StreamKey::Call(call_id.clone()),
            (None, HuntEventKind::MemberStateChanged { member_id, .. }) => StreamKey::Member(member_id.clone()),
            (None, _) => StreamKey::Group(self.group_id.clone()),
        }
    }
}

/// Ordering domain for sequence numbers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    Call(CallId),
    Member(MemberId),
    Group(HuntGroupId),
}

/// Fan-out of hunt events to any number of consumers
///
/// Delivery is unbounded and in publish order per subscriber. Subscribers
/// that dropped their receiver are pruned on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<HuntEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HuntEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn publish(&self, event: HuntEvent) {
        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for tx in subscribers.iter() {
                if tx.send(event.clone()).is_err() {
                    closed = true;
                }
            }
        }
        if closed {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|tx| !tx.is_closed());
            debug!("Pruned closed event subscribers, {} remaining", subscribers.len());
        }
    }
}
