//! Safety Limit Configuration

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which side of the cut threshold is unsafe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitDirection {
    /// Values above `cut` are unsafe (max RPM, max boost)
    #[default]
    Upper,
    /// Values below `cut` are unsafe (min oil pressure)
    Lower,
}

/// Cut/resume pair for one named limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// Boundary of the safe range
    pub cut: f64,
    /// Value a tripped limit must return past before it clears
    pub resume: f64,
    #[serde(default)]
    pub direction: LimitDirection,
}

impl Threshold {
    pub fn upper(cut: f64, resume: f64) -> Self {
        Self {
            cut,
            resume,
            direction: LimitDirection::Upper,
        }
    }

    pub fn lower(cut: f64, resume: f64) -> Self {
        Self {
            cut,
            resume,
            direction: LimitDirection::Lower,
        }
    }

    /// Whether `value` is on the safe side of (or at) the cut
    pub fn permits(&self, value: f64) -> bool {
        match self.direction {
            LimitDirection::Upper => value <= self.cut,
            LimitDirection::Lower => value >= self.cut,
        }
    }

    /// Whether `value` has returned far enough to clear a tripped limit
    pub fn resumes(&self, value: f64) -> bool {
        match self.direction {
            LimitDirection::Upper => value <= self.resume,
            LimitDirection::Lower => value >= self.resume,
        }
    }

    /// Whether this cut leaves a smaller safe range than `other`'s
    pub fn is_stricter_than(&self, other: &Threshold) -> bool {
        match self.direction {
            LimitDirection::Upper => self.cut < other.cut,
            LimitDirection::Lower => self.cut > other.cut,
        }
    }

    fn check(&self, name: &str) -> Result<(), ConfigurationError> {
        if !self.cut.is_finite() || !self.resume.is_finite() {
            return Err(ConfigurationError::NonFinite {
                name: name.to_string(),
            });
        }
        let (ordered, side) = match self.direction {
            LimitDirection::Upper => (self.resume < self.cut, "below"),
            LimitDirection::Lower => (self.resume > self.cut, "above"),
        };
        if !ordered {
            return Err(ConfigurationError::InvertedThreshold {
                name: name.to_string(),
                cut: self.cut,
                resume: self.resume,
                side,
            });
        }
        Ok(())
    }
}

/// Named safety limits, loaded once and changed only by reconfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SafetyLimits {
    limits: BTreeMap<String, Threshold>,
}

impl SafetyLimits {
    /// No limits at all; every command is rejected
    pub fn empty() -> Self {
        Self {
            limits: BTreeMap::new(),
        }
    }

    /// Add or replace a limit
    pub fn with(mut self, name: &str, threshold: Threshold) -> Self {
        self.limits.insert(name.to_string(), threshold);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Threshold> {
        self.limits.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Threshold)> {
        self.limits.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Apply `other` where it is stricter. Only limits already present are
    /// touched, so a parameter with no limit stays unwritable.
    pub fn tightened_by(&self, other: &SafetyLimits) -> SafetyLimits {
        let mut limits = self.limits.clone();
        for (name, current) in limits.iter_mut() {
            let Some(candidate) = other.get(name) else {
                continue;
            };
            if candidate.direction == current.direction && candidate.is_stricter_than(current) {
                *current = *candidate;
            }
        }
        SafetyLimits { limits }
    }

    /// Check every threshold's ordering. Runs at load and reconfiguration,
    /// never per command.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, threshold) in &self.limits {
            if name.trim().is_empty() {
                return Err(ConfigurationError::EmptyName);
            }
            threshold.check(name)?;
        }
        Ok(())
    }
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self::empty()
            .with("max_rpm", Threshold::upper(7000.0, 6500.0))
            .with("max_boost", Threshold::upper(30.0, 25.0))
            .with("max_egt", Threshold::upper(900.0, 850.0))
            .with("max_coolant_temp", Threshold::upper(115.0, 105.0))
            .with("min_oil_pressure", Threshold::lower(10.0, 15.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SafetyLimits::default().validate().is_ok());
        assert_eq!(SafetyLimits::default().len(), 5);
    }

    #[test]
    fn test_inverted_upper_rejected() {
        let limits = SafetyLimits::empty().with("max_boost", Threshold::upper(30.0, 30.0));
        assert!(matches!(
            limits.validate(),
            Err(ConfigurationError::InvertedThreshold { side: "below", .. })
        ));
    }

    #[test]
    fn test_inverted_lower_rejected() {
        let limits = SafetyLimits::empty().with("min_oil_pressure", Threshold::lower(10.0, 5.0));
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        let limits = SafetyLimits::empty().with("max_rpm", Threshold::upper(f64::NAN, 1.0));
        assert!(matches!(limits.validate(), Err(ConfigurationError::NonFinite { .. })));
    }

    #[test]
    fn test_tightening_only_narrows() {
        let configured = SafetyLimits::empty()
            .with("max_boost", Threshold::upper(30.0, 25.0))
            .with("max_rpm", Threshold::upper(6000.0, 5500.0))
            .with("min_oil_pressure", Threshold::lower(10.0, 15.0));
        let device = SafetyLimits::empty()
            .with("max_boost", Threshold::upper(22.0, 20.0))
            .with("max_rpm", Threshold::upper(8000.0, 7500.0))
            .with("min_oil_pressure", Threshold::lower(12.0, 14.0))
            .with("max_egt", Threshold::upper(900.0, 850.0));

        let merged = configured.tightened_by(&device);
        assert_eq!(merged.get("max_boost"), Some(&Threshold::upper(22.0, 20.0)));
        assert_eq!(merged.get("max_rpm"), Some(&Threshold::upper(6000.0, 5500.0)));
        assert_eq!(merged.get("min_oil_pressure"), Some(&Threshold::lower(12.0, 14.0)));
        assert_eq!(merged.get("max_egt"), None);
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_default_direction() {
        let json = r#"{"max_boost": {"cut": 30.0, "resume": 25.0},
                       "min_oil_pressure": {"cut": 10.0, "resume": 15.0, "direction": "lower"}}"#;
        let limits: SafetyLimits = serde_json::from_str(json).unwrap();
        assert_eq!(limits.get("max_boost"), Some(&Threshold::upper(30.0, 25.0)));
        assert_eq!(
            limits.get("min_oil_pressure").map(|t| t.direction),
            Some(LimitDirection::Lower)
        );
        assert!(limits.validate().is_ok());
    }
}
