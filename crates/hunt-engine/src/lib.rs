//! # Hunt group call distribution for rvoip
//!
//! Delivers calls arriving at a hunt group's pilot extension to exactly one
//! member, following the group's hunt strategy, and escalates to the group's
//! no-answer destination when nobody answers.
//!
//! ## Architecture
//!
//! - [`tracker::MemberStateTracker`]: per-member availability, concurrent
//!   call counts and wrap-up, with atomic reserve/release
//! - [`resolver::HuntStrategyResolver`]: pure candidate ordering for the
//!   linear, circular, uniform, weighted and skill-based strategies
//! - [`session::RingSessionMachine`]: the per-call state machine that rings
//!   members one at a time, cycles, and escalates
//! - [`escalation::EscalationRouter`]: maps a group's no-answer destination
//!   to a redirect instruction
//! - [`stats::StatisticsAggregator`]: daily per-group and per-member
//!   counters built from the event stream
//! - [`engine::HuntEngine`]: the facade the call-handling layer uses
//!
//! Telephony (ringing, redirecting) and group configuration are reached only
//! through the [`telephony::TelephonyProvider`] and
//! [`directory::GroupDirectory`] traits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use async_trait::async_trait;
//! use rvoip_hunt_engine::prelude::*;
//!
//! struct Pbx;
//!
//! #[async_trait]
//! impl TelephonyProvider for Pbx {
//!     async fn ring(&self, _call: &CallId, _extension: &str, _timeout: Duration) -> Result<RingOutcome> {
//!         Ok(RingOutcome::Answered)
//!     }
//!
//!     async fn redirect(&self, _call: &CallId, _instruction: &RedirectInstruction) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let config = HuntEngineConfig::from_file("hunt.toml")?;
//! init_logging(&config.logging)?;
//!
//! let engine = HuntEngine::from_config(config, Arc::new(Pbx)).await?;
//! let handle = engine.handle_inbound_call(InboundCall::new("sales", "+15551234567")).await?;
//! match handle.outcome().await? {
//!     SessionOutcome::Connected { member_id, .. } => println!("answered by {member_id}"),
//!     other => println!("not answered: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod events;
pub mod logging;
pub mod resolver;
pub mod session;
pub mod stats;
pub mod telephony;
pub mod tracker;
pub mod types;

pub use config::{GeneralConfig, HuntEngineConfig, HuntGroupDefinition, StatisticsConfig};
pub use directory::{GroupDirectory, InMemoryGroupDirectory};
pub use engine::{HuntEngine, SessionHandle};
pub use error::{HuntError, Result};
pub use escalation::{EscalationReason, EscalationRouter, RedirectInstruction};
pub use events::{EventBus, HuntEvent, HuntEventKind, MemberChange, RingAttemptOutcome, TerminalKind};
pub use logging::{init_logging, LoggingConfig};
pub use resolver::HuntStrategyResolver;
pub use session::{RingSession, RingSessionMachine, SessionOutcome, SessionState, TerminalState};
pub use stats::{GroupDailyStats, MemberDailyStats, StatisticsAggregator};
pub use telephony::{RingOutcome, TelephonyProvider};
pub use tracker::{GroupSnapshot, MemberRuntimeState, MemberSnapshot, MemberStateTracker};
pub use types::{CallId, HuntGroup, HuntGroupId, HuntType, InboundCall, Member, MemberId, NoAnswerDestination};

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        init_logging, CallId, EscalationReason, GroupDirectory, HuntEngine, HuntEngineConfig, HuntError,
        HuntGroup, HuntGroupId, HuntType, InMemoryGroupDirectory, InboundCall, Member, MemberId,
        NoAnswerDestination, RedirectInstruction, Result, RingOutcome, SessionHandle, SessionOutcome,
        SessionState, TelephonyProvider, TerminalState,
    };
}
