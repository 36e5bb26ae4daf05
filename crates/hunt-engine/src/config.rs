//! # Hunt Engine Configuration
//!
//! Configuration is plain serde data with defaults for every field, so a TOML
//! file only needs to mention what it changes:
//!
//! ```toml
//! [general]
//! telephony_retry_attempts = 1
//!
//! [logging]
//! level = "debug"
//!
//! [[groups]]
//! id = "sales"
//! extension = "600"
//! hunt_type = "circular"
//! ring_timeout_seconds = 15
//! max_cycles = 2
//! no_answer_destination = "queue"
//! no_answer_target = "sales-overflow"
//!
//! [[groups.members]]
//! member_id = "alice"
//! extension = "1001"
//! priority = 1
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HuntError, Result};
use crate::logging::LoggingConfig;
use crate::session::SessionSettings;
use crate::types::{HuntGroup, Member};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HuntEngineConfig {
    pub general: GeneralConfig,
    pub statistics: StatisticsConfig,
    pub logging: LoggingConfig,
    /// Static hunt groups used to seed the in-memory directory
    pub groups: Vec<HuntGroupDefinition>,
}

/// Session and tracker behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Immediate retries after a failed ring or redirect request
    pub telephony_retry_attempts: u32,

    /// Consecutive reservation races tolerated in one dispatch
    pub max_reservation_retries: u32,

    /// Presence of members the first time their roster is loaded
    pub members_start_available: bool,
}

/// Statistics aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// How far behind the newest sequence number an event may arrive and still count
    pub reorder_window: u64,

    /// Days of history kept; older days are purged by the daily rollover
    pub retention_days: u32,
}

/// A hunt group together with its roster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntGroupDefinition {
    #[serde(flatten)]
    pub group: HuntGroup,

    #[serde(default)]
    pub members: Vec<Member>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            telephony_retry_attempts: 1,
            max_reservation_retries: 8,
            members_start_available: true,
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            reorder_window: 64,
            retention_days: 7,
        }
    }
}

impl HuntEngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.telephony_retry_attempts > 5 {
            return Err(HuntError::config("telephony_retry_attempts cannot exceed 5"));
        }
        if self.statistics.reorder_window == 0 {
            return Err(HuntError::config("reorder_window must be greater than 0"));
        }
        self.logging.validate()?;

        let mut group_ids = HashSet::new();
        let mut member_ids = HashSet::new();
        for definition in &self.groups {
            definition.group.validate()?;
            definition.group.validate_members(&definition.members)?;
            if !group_ids.insert(&definition.group.id) {
                return Err(HuntError::config(format!("duplicate hunt group {}", definition.group.id)));
            }
            for member in &definition.members {
                if !member_ids.insert(&member.member_id) {
                    return Err(HuntError::config(format!(
                        "member {} is listed in more than one hunt group",
                        member.member_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            telephony_retry_attempts: self.general.telephony_retry_attempts,
            max_reservation_retries: self.general.max_reservation_retries,
        }
    }
}
