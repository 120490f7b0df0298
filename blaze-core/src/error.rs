//! Error types for Blaze cache operations

use std::time::Duration;
use thiserror::Error;

use crate::TierId;

/// Failures of a single backing tier.
///
/// These never escape the coordinator: they are logged at the tier-call
/// site and the tier is treated as having missed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierError {
    #[error("Tier {tier} unavailable: {reason}")]
    Unavailable { tier: TierId, reason: String },

    #[error("Tier {tier} timed out after {elapsed:?} during {operation}")]
    Timeout {
        tier: TierId,
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("Serialization failed on {tier}: {reason}")]
    Serialization { tier: TierId, reason: String },

    #[error("Backend error on {tier}: {reason}")]
    Backend { tier: TierId, reason: String },
}

impl TierError {
    /// The tier that produced this error.
    pub fn tier(&self) -> TierId {
        match self {
            Self::Unavailable { tier, .. }
            | Self::Timeout { tier, .. }
            | Self::Serialization { tier, .. }
            | Self::Backend { tier, .. } => *tier,
        }
    }

    pub fn backend(tier: TierId, reason: impl Into<String>) -> Self {
        Self::Backend {
            tier,
            reason: reason.into(),
        }
    }

    pub fn serialization(tier: TierId, reason: impl Into<String>) -> Self {
        Self::Serialization {
            tier,
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

impl ConfigError {
    pub(crate) fn invalid(
        field: &str,
        value: impl std::fmt::Debug,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", value),
            reason: reason.into(),
        }
    }
}

/// Origin fetcher errors.
///
/// The cache has no opinion on retries; a fetcher reports its final
/// outcome and the SWR engine decides whether the caller sees it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Origin fetch failed for {key}: {reason}")]
    Origin { key: String, reason: String },

    #[error("Origin has no data for {key}")]
    NotFound { key: String },

    #[error("Origin fetch for {key} was cancelled")]
    Cancelled { key: String },
}

impl FetchError {
    pub fn origin(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Origin {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Master error type for all Blaze cache errors.
#[derive(Debug, Clone, Error)]
pub enum BlazeError {
    #[error("Tier error: {0}")]
    Tier(#[from] TierError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BlazeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for Blaze cache operations.
pub type BlazeResult<T> = Result<T, BlazeError>;

// =============================================================================
// TESTS
// =============================================================================
