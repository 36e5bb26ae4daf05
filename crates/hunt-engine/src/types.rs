//! Core hunt group data model
//!
//! Hunt groups and their members are supplied by configuration management and
//! are read-only to the engine. Everything mutable about a member lives in the
//! [`MemberStateTracker`](crate::tracker::MemberStateTracker).

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HuntError, Result};
use crate::escalation::EscalationRouter;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Hunt group identifier
    HuntGroupId
);
string_id!(
    /// Group-scoped member identifier
    MemberId
);
string_id!(
    /// Identifier of one inbound call
    CallId
);

impl CallId {
    /// Generate a fresh random call id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// How a hunt group picks the next member to ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HuntType {
    /// Lowest priority first, every call starts from the top
    Linear,
    /// Like linear, but each new call starts after the last offered member
    Circular,
    /// Fewest current calls, longest since last offer
    Uniform,
    /// Priority-weighted draw, deterministic per call
    Weighted,
    /// Restricted to members holding the call's skill, uniform within
    SkillBased,
}

impl HuntType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HuntType::Linear => "linear",
            HuntType::Circular => "circular",
            HuntType::Uniform => "uniform",
            HuntType::Weighted => "weighted",
            HuntType::SkillBased => "skill_based",
        }
    }
}

impl fmt::Display for HuntType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HuntType {
    type Err = HuntError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "linear" => Ok(HuntType::Linear),
            "circular" | "round_robin" => Ok(HuntType::Circular),
            "uniform" => Ok(HuntType::Uniform),
            "weighted" => Ok(HuntType::Weighted),
            "skill_based" | "skillbased" | "skill" => Ok(HuntType::SkillBased),
            other => Err(HuntError::config(format!("unknown hunt type: {}", other))),
        }
    }
}

/// Where a call goes when nobody answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoAnswerDestination {
    Voicemail,
    Extension,
    Queue,
    Disconnect,
}

impl fmt::Display for NoAnswerDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NoAnswerDestination::Voicemail => "voicemail",
            NoAnswerDestination::Extension => "extension",
            NoAnswerDestination::Queue => "queue",
            NoAnswerDestination::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

/// A hunt group definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntGroup {
    pub id: HuntGroupId,

    #[serde(default)]
    pub name: String,

    /// Routable extension callers dial to reach the group
    pub extension: String,

    pub hunt_type: HuntType,

    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_seconds: u64,

    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,

    #[serde(default)]
    pub wrap_up_seconds: u64,

    #[serde(default = "default_no_answer_destination")]
    pub no_answer_destination: NoAnswerDestination,

    /// Fallback extension, queue name or mailbox, depending on the destination
    #[serde(default)]
    pub no_answer_target: Option<String>,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Longest a single member may be rung before the attempt counts as unanswered
pub const MAX_RING_TIMEOUT_SECONDS: u64 = 3_600;

/// Longest wrap-up a member can be held for after a call
pub const MAX_WRAP_UP_SECONDS: u64 = 86_400;

fn default_ring_timeout() -> u64 {
    20
}

fn default_max_cycles() -> u32 {
    1
}

fn default_no_answer_destination() -> NoAnswerDestination {
    NoAnswerDestination::Voicemail
}

fn default_true() -> bool {
    true
}

impl HuntGroup {
    pub fn new(id: impl Into<HuntGroupId>, extension: impl Into<String>, hunt_type: HuntType) -> Self {
        let id = id.into();
        Self {
            name: id.0.clone(),
            id,
            extension: extension.into(),
            hunt_type,
            ring_timeout_seconds: default_ring_timeout(),
            max_cycles: default_max_cycles(),
            wrap_up_seconds: 0,
            no_answer_destination: default_no_answer_destination(),
            no_answer_target: None,
            is_active: true,
        }
    }

    pub fn with_ring_timeout(mut self, seconds: u64) -> Self {
        self.ring_timeout_seconds = seconds;
        self
    }

    pub fn with_max_cycles(mut self, cycles: u32) -> Self {
        self.max_cycles = cycles;
        self
    }

    pub fn with_wrap_up(mut self, seconds: u64) -> Self {
        self.wrap_up_seconds = seconds;
        self
    }

    pub fn with_no_answer(mut self, destination: NoAnswerDestination, target: Option<&str>) -> Self {
        self.no_answer_destination = destination;
        self.no_answer_target = target.map(str::to_string);
        self
    }

    pub fn ring_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ring_timeout_seconds)
    }

    pub fn wrap_up(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.wrap_up_seconds)
    }

    /// Validate the group definition
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(HuntError::config("hunt group id cannot be empty"));
        }
        if self.extension.trim().is_empty() {
            return Err(HuntError::config(format!("hunt group {} has no extension", self.id)));
        }
        if self.ring_timeout_seconds == 0 {
            return Err(HuntError::config(format!(
                "hunt group {}: ring_timeout_seconds must be greater than 0",
                self.id
            )));
        }
        if self.ring_timeout_seconds > MAX_RING_TIMEOUT_SECONDS {
            return Err(HuntError::config(format!(
                "hunt group {}: ring_timeout_seconds {} exceeds {}",
                self.id, self.ring_timeout_seconds, MAX_RING_TIMEOUT_SECONDS
            )));
        }
        if self.wrap_up_seconds > MAX_WRAP_UP_SECONDS {
            return Err(HuntError::config(format!(
                "hunt group {}: wrap_up_seconds {} exceeds {}",
                self.id, self.wrap_up_seconds, MAX_WRAP_UP_SECONDS
            )));
        }
        if self.max_cycles == 0 {
            return Err(HuntError::config(format!(
                "hunt group {}: max_cycles must be at least 1",
                self.id
            )));
        }
        EscalationRouter::resolve(self.no_answer_destination, self.no_answer_target.as_deref())
            .map(|_| ())
            .map_err(|e| HuntError::config(format!("hunt group {}: {}", self.id, e)))
    }

    /// Validate a roster against this group
    pub fn validate_members(&self, members: &[Member]) -> Result<()> {
        let mut seen = HashSet::new();
        for member in members {
            member.validate()?;
            if !seen.insert(&member.member_id) {
                return Err(HuntError::config(format!(
                    "hunt group {}: duplicate member {}",
                    self.id, member.member_id
                )));
            }
        }
        Ok(())
    }
}

/// A group-scoped member record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: MemberId,

    /// Owning group; filled in by the directory when omitted in configuration
    #[serde(default)]
    pub group_id: HuntGroupId,

    /// Extension rung when this member is offered a call
    pub extension: String,

    /// Lower rings first
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: u32,

    #[serde(default)]
    pub skills: BTreeSet<String>,
}

fn default_priority() -> u32 {
    1
}

fn default_max_concurrent_calls() -> u32 {
    1
}

impl Member {
    pub fn new(member_id: impl Into<MemberId>, extension: impl Into<String>, priority: u32) -> Self {
        Self {
            member_id: member_id.into(),
            group_id: HuntGroupId::default(),
            extension: extension.into(),
            priority,
            max_concurrent_calls: default_max_concurrent_calls(),
            skills: BTreeSet::new(),
        }
    }

    pub fn with_max_concurrent_calls(mut self, max: u32) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        self.skills.contains(skill)
    }

    pub fn validate(&self) -> Result<()> {
        if self.member_id.as_str().is_empty() {
            return Err(HuntError::config("member id cannot be empty"));
        }
        if self.extension.trim().is_empty() {
            return Err(HuntError::config(format!("member {} has no extension", self.member_id)));
        }
        if self.max_concurrent_calls == 0 {
            return Err(HuntError::config(format!(
                "member {}: max_concurrent_calls must be at least 1",
                self.member_id
            )));
        }
        Ok(())
    }
}

/// Inbound call metadata handed over by the call-handling layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCall {
    pub call_id: CallId,
    pub group_id: HuntGroupId,
    pub caller: String,
    /// Skill tag the call requires, used by skill-based groups
    pub required_skill: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundCall {
    pub fn new(group_id: impl Into<HuntGroupId>, caller: impl Into<String>) -> Self {
        Self {
            call_id: CallId::generate(),
            group_id: group_id.into(),
            caller: caller.into(),
            required_skill: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<CallId>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.required_skill = Some(skill.into());
        self
    }
}
