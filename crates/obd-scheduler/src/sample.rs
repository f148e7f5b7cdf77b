//! Monitoring samples

use obd_protocol::PidValue;
use ring_buffer::Timestamped;
use safety_validator::SafetyEvent;
use serde::{Deserialize, Serialize};

/// Result of querying one PID in a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub pid: u8,
    /// None when the query failed this round
    pub value: Option<PidValue>,
}

impl Reading {
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

/// One monitoring round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSample {
    pub timestamp_ms: u64,
    /// Round number, starting at 0
    pub round: u64,
    /// One entry per monitored PID, in query order
    pub readings: Vec<Reading>,
    /// Cut/resume transitions triggered by this round
    pub safety_events: Vec<SafetyEvent>,
}

impl MonitorSample {
    /// Converted value of `pid`, if it was read successfully
    pub fn value(&self, pid: u8) -> Option<f64> {
        self.readings
            .iter()
            .find(|r| r.pid == pid)
            .and_then(|r| r.value.as_ref())
            .map(|v| v.value)
    }

    /// Per-PID validity flags in query order
    pub fn validity(&self) -> Vec<(u8, bool)> {
        self.readings.iter().map(|r| (r.pid, r.is_valid())).collect()
    }

    pub fn all_valid(&self) -> bool {
        self.readings.iter().all(Reading::is_valid)
    }
}

impl Timestamped for MonitorSample {
    fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}
