//! Command Validator

use crate::error::{ConfigurationError, SafetyError};
use crate::limits::SafetyLimits;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A write/control command bound for the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    /// Name of the limited parameter, e.g. "max_boost"
    pub parameter: String,
    /// Requested value
    pub value: f64,
}

impl ControlCommand {
    pub fn new(parameter: impl Into<String>, value: f64) -> Self {
        Self {
            parameter: parameter.into(),
            value,
        }
    }
}

/// Checks control commands against the configured safety limits.
///
/// Only limit values are configurable; there is no switch that turns
/// validation off.
#[derive(Debug, Clone)]
pub struct Validator {
    limits: SafetyLimits,
}

impl Validator {
    /// Create a validator, rejecting limits with bad cut/resume ordering
    pub fn new(limits: SafetyLimits) -> Result<Self, ConfigurationError> {
        limits.validate()?;
        info!("Safety validator loaded with {} limits", limits.len());
        Ok(Self { limits })
    }

    /// Validate a single value against a named limit
    pub fn validate_range(&self, parameter: &str, value: f64) -> Result<(), SafetyError> {
        if !value.is_finite() {
            return Err(SafetyError::NonFiniteValue {
                parameter: parameter.to_string(),
                value,
            });
        }
        let threshold = self
            .limits
            .get(parameter)
            .ok_or_else(|| SafetyError::NoLimitConfigured(parameter.to_string()))?;
        if threshold.permits(value) {
            Ok(())
        } else {
            Err(SafetyError::OutOfSafeRange {
                parameter: parameter.to_string(),
                value,
                limit: threshold.cut,
            })
        }
    }

    /// Validate a control command. Violations are rejected, never clamped.
    pub fn validate(&self, command: &ControlCommand) -> Result<(), SafetyError> {
        self.validate_range(&command.parameter, command.value)
            .map_err(|e| {
                warn!("Rejected control command: {}", e);
                e
            })
    }

    /// Replace the limits after checking their ordering. On error the old
    /// limits stay in force.
    pub fn reconfigure(&mut self, limits: SafetyLimits) -> Result<(), ConfigurationError> {
        limits.validate()?;
        info!("Safety limits reconfigured ({} limits)", limits.len());
        self.limits = limits;
        Ok(())
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Threshold;
    use proptest::prelude::*;

    fn boost_validator() -> Validator {
        Validator::new(SafetyLimits::empty().with("max_boost", Threshold::upper(30.0, 25.0))).unwrap()
    }

    #[test]
    fn test_boost_over_limit_rejected() {
        let validator = boost_validator();
        assert_eq!(
            validator.validate(&ControlCommand::new("max_boost", 35.0)),
            Err(SafetyError::OutOfSafeRange {
                parameter: "max_boost".into(),
                value: 35.0,
                limit: 30.0
            })
        );
    }

    #[test]
    fn test_boost_under_limit_accepted() {
        let validator = boost_validator();
        assert!(validator.validate(&ControlCommand::new("max_boost", 25.0)).is_ok());
        assert!(validator.validate(&ControlCommand::new("max_boost", 30.0)).is_ok());
    }

    #[test]
    fn test_unlimited_parameter_rejected() {
        let validator = boost_validator();
        assert_eq!(
            validator.validate(&ControlCommand::new("ignition_timing", 1.0)),
            Err(SafetyError::NoLimitConfigured("ignition_timing".into()))
        );
    }

    #[test]
    fn test_nan_rejected() {
        let validator = boost_validator();
        assert!(matches!(
            validator.validate(&ControlCommand::new("max_boost", f64::NAN)),
            Err(SafetyError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn test_lower_limit() {
        let validator = Validator::default();
        assert!(validator.validate_range("min_oil_pressure", 20.0).is_ok());
        assert!(validator.validate_range("min_oil_pressure", 5.0).is_err());
    }

    #[test]
    fn test_reconfigure_keeps_old_limits_on_error() {
        let mut validator = boost_validator();
        let bad = SafetyLimits::empty().with("max_boost", Threshold::upper(20.0, 40.0));
        assert!(validator.reconfigure(bad).is_err());
        assert!(validator.validate(&ControlCommand::new("max_boost", 28.0)).is_ok());

        let tighter = SafetyLimits::empty().with("max_boost", Threshold::upper(20.0, 15.0));
        validator.reconfigure(tighter).unwrap();
        assert!(validator.validate(&ControlCommand::new("max_boost", 28.0)).is_err());
    }

    #[test]
    fn test_inverted_limits_block_construction() {
        let limits = SafetyLimits::empty().with("max_rpm", Threshold::upper(6000.0, 6500.0));
        assert!(Validator::new(limits).is_err());
    }

    proptest! {
        #[test]
        fn prop_accepts_exactly_up_to_cut(cut in 1.0f64..1000.0, value in -1000.0f64..2000.0) {
            let limits = SafetyLimits::empty().with("p", Threshold::upper(cut, cut - 0.5));
            let validator = Validator::new(limits).unwrap();
            let accepted = validator.validate(&ControlCommand::new("p", value)).is_ok();
            prop_assert_eq!(accepted, value <= cut);
        }
    }
}
