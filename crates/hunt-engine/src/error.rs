//! Error types for the hunt group engine
//!
//! Only conditions that callers must act on are errors. An empty candidate
//! list and a lost reservation race are ordinary dispatch outcomes handled
//! inside the ring session and never show up here.

use thiserror::Error;

/// Result type for hunt engine operations
pub type Result<T> = std::result::Result<T, HuntError>;

/// Errors produced by the hunt engine
#[derive(Debug, Error)]
pub enum HuntError {
    /// Invalid or missing hunt group / destination configuration.
    ///
    /// Fatal for the call in question and never retried automatically.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A programming defect, e.g. a release without a matching reservation
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Unknown group, member or call
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The telephony collaborator failed a request after retries
    #[error("Telephony error: {message}")]
    Telephony { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HuntError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Create a telephony error
    pub fn telephony(message: impl Into<String>) -> Self {
        Self::Telephony {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error indicates bad configuration rather than a runtime fault
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<toml::de::Error> for HuntError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("invalid TOML: {}", err))
    }
}

impl From<std::io::Error> for HuntError {
    fn from(err: std::io::Error) -> Self {
        Self::config(format!("unable to read configuration: {}", err))
    }
}
