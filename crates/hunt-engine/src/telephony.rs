//! Telephony collaborator interface
//!
//! The engine never speaks SIP itself. The call-handling layer implements
//! [`TelephonyProvider`] on top of its signaling stack and forwards caller
//! hang-ups to [`HuntEngine::cancel_call`](crate::engine::HuntEngine::cancel_call)
//! and call completion to [`HuntEngine::call_ended`](crate::engine::HuntEngine::call_ended).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::escalation::RedirectInstruction;
use crate::types::CallId;

/// Result of ringing one extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingOutcome {
    /// The member picked up and the call is bridged
    Answered,
    /// The extension was busy
    Busy,
    /// The member explicitly declined
    Rejected,
    /// The provider gave up before the engine's deadline
    NoAnswer,
}

/// Operations the engine needs from the telephony layer
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Ring `extension` on behalf of `call_id` for at most `timeout`
    ///
    /// The engine enforces the deadline itself and drops this future when it
    /// elapses or when the caller hangs up, so implementations need not race
    /// their own timer.
    async fn ring(&self, call_id: &CallId, extension: &str, timeout: Duration) -> Result<RingOutcome>;

    /// Redirect the caller once hunting is over
    async fn redirect(&self, call_id: &CallId, instruction: &RedirectInstruction) -> Result<()>;

    /// Stop an outstanding ring after the caller hung up
    async fn stop_ringing(&self, _call_id: &CallId, _extension: &str) -> Result<()> {
        Ok(())
    }
}
