//! Cut/Resume Hysteresis for Live Readings

use crate::limits::SafetyLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// Transition of a named limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyEvent {
    /// Reading crossed the cut threshold
    Cut { limit: String, value: f64 },
    /// Reading returned past the resume threshold
    Resumed { limit: String, value: f64 },
}

/// Tracks which limits are tripped. A limit trips when a reading crosses
/// `cut` and clears only once a reading is back past `resume`.
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    limits: SafetyLimits,
    tripped: HashSet<String>,
}

impl SafetyMonitor {
    /// Limits are expected to be validated already
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            tripped: HashSet::new(),
        }
    }

    /// Feed one reading for `limit`. Returns an event on a state change.
    pub fn observe(&mut self, limit: &str, value: f64) -> Option<SafetyEvent> {
        let threshold = self.limits.get(limit)?;
        if !value.is_finite() {
            return None;
        }

        if self.tripped.contains(limit) {
            if threshold.resumes(value) {
                self.tripped.remove(limit);
                info!("Safety limit {} resumed at {}", limit, value);
                return Some(SafetyEvent::Resumed {
                    limit: limit.to_string(),
                    value,
                });
            }
        } else if !threshold.permits(value) {
            self.tripped.insert(limit.to_string());
            warn!("Safety limit {} cut at {} (cut {})", limit, value, threshold.cut);
            return Some(SafetyEvent::Cut {
                limit: limit.to_string(),
                value,
            });
        }
        None
    }

    pub fn is_tripped(&self, limit: &str) -> bool {
        self.tripped.contains(limit)
    }

    /// Replace the limits and clear all trip state
    pub fn reset(&mut self, limits: SafetyLimits) {
        self.limits = limits;
        self.tripped.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Threshold;

    #[test]
    fn test_upper_hysteresis() {
        let mut monitor =
            SafetyMonitor::new(SafetyLimits::empty().with("max_rpm", Threshold::upper(7000.0, 6500.0)));

        assert_eq!(monitor.observe("max_rpm", 6900.0), None);
        assert!(matches!(monitor.observe("max_rpm", 7100.0), Some(SafetyEvent::Cut { .. })));
        // Between resume and cut: still tripped
        assert_eq!(monitor.observe("max_rpm", 6800.0), None);
        assert!(monitor.is_tripped("max_rpm"));
        assert!(matches!(
            monitor.observe("max_rpm", 6400.0),
            Some(SafetyEvent::Resumed { .. })
        ));
        assert!(!monitor.is_tripped("max_rpm"));
    }

    #[test]
    fn test_lower_hysteresis() {
        let mut monitor = SafetyMonitor::new(
            SafetyLimits::empty().with("min_oil_pressure", Threshold::lower(10.0, 15.0)),
        );
        assert!(matches!(
            monitor.observe("min_oil_pressure", 8.0),
            Some(SafetyEvent::Cut { .. })
        ));
        assert_eq!(monitor.observe("min_oil_pressure", 12.0), None);
        assert!(matches!(
            monitor.observe("min_oil_pressure", 16.0),
            Some(SafetyEvent::Resumed { .. })
        ));
    }

    #[test]
    fn test_unknown_limit_ignored() {
        let mut monitor = SafetyMonitor::new(SafetyLimits::default());
        assert_eq!(monitor.observe("max_widget", 1e9), None);
    }
}
