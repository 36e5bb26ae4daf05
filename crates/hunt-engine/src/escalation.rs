//! Escalation routing
//!
//! Translates a group's no-answer destination into the redirect instruction
//! handed to the telephony provider once every ring attempt is exhausted.

use serde::{Deserialize, Serialize};

use crate::error::{HuntError, Result};
use crate::types::NoAnswerDestination;

/// Terminal redirect for a call nobody answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum RedirectInstruction {
    /// Send to voicemail, optionally a specific mailbox
    Voicemail(Option<String>),
    /// Transfer to a fallback extension
    Extension(String),
    /// Place in a named queue
    Queue(String),
    /// Hang up on the caller
    Disconnect,
}

/// Why a session escalated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Every cycle was exhausted without an answer
    CyclesExhausted,
    /// The resolver had no candidate to offer
    NoCandidateAvailable,
    /// The group is disabled
    GroupInactive,
}

/// Stateless router from destination configuration to redirect instruction
pub struct EscalationRouter;

impl EscalationRouter {
    /// Resolve the redirect for a destination and optional target
    ///
    /// Extension and queue destinations need a non-empty target. Group
    /// validation already checks this, so a failure here means configuration
    /// changed underneath a live call.
    pub fn resolve(destination: NoAnswerDestination, target: Option<&str>) -> Result<RedirectInstruction> {
        let target = target.map(str::trim).filter(|t| !t.is_empty());

        match destination {
            NoAnswerDestination::Voicemail => Ok(RedirectInstruction::Voicemail(target.map(str::to_string))),
            NoAnswerDestination::Extension => target
                .map(|t| RedirectInstruction::Extension(t.to_string()))
                .ok_or_else(|| HuntError::config("extension destination requires a target extension")),
            NoAnswerDestination::Queue => target
                .map(|t| RedirectInstruction::Queue(t.to_string()))
                .ok_or_else(|| HuntError::config("queue destination requires a queue name")),
            NoAnswerDestination::Disconnect => Ok(RedirectInstruction::Disconnect),
        }
    }
}
