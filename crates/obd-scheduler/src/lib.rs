//! OBD-II Live Data Monitoring
//!
//! One periodic task queries a PID set sequentially each round and stores
//! the round as a [`MonitorSample`] in a fixed-capacity history buffer.
//! Missed ticks are delayed, never burst.

mod monitor;
mod sample;

pub use monitor::{
    start_monitor, MonitorConfig, MonitorError, MonitorHandle, PidSource, SafetyBinding,
    SourceError,
};
pub use sample::{MonitorSample, Reading};
