//! Safety Error Types

use thiserror::Error;

/// A control command that must not be sent
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyError {
    /// Value outside the configured safe range
    #[error("{parameter} value {value} is outside the safe range (limit {limit})")]
    OutOfSafeRange {
        parameter: String,
        value: f64,
        limit: f64,
    },

    /// No limit exists for the parameter, so it cannot be written
    #[error("No safety limit configured for {0}")]
    NoLimitConfigured(String),

    /// NaN or infinite value
    #[error("{parameter} value {value} is not a finite number")]
    NonFiniteValue { parameter: String, value: f64 },
}

/// Invalid safety limit configuration, rejected before startup
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// Resume threshold not strictly inside the safe side of the cut
    #[error("{name}: resume {resume} must be strictly {side} cut {cut}")]
    InvertedThreshold {
        name: String,
        cut: f64,
        resume: f64,
        side: &'static str,
    },

    /// Threshold is NaN or infinite
    #[error("{name}: thresholds must be finite")]
    NonFinite { name: String },

    /// Empty limit name
    #[error("Safety limit with empty name")]
    EmptyName,
}
