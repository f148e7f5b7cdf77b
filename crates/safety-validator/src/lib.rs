//! Command Safety Validation
//!
//! Every outbound write/control command is checked against named safety
//! limits before it reaches a device. Limits carry independent cut and
//! resume thresholds whose ordering is checked when they are loaded.

mod error;
mod limits;
mod monitor;
mod validator;

pub use error::{ConfigurationError, SafetyError};
pub use limits::{LimitDirection, SafetyLimits, Threshold};
pub use monitor::{SafetyEvent, SafetyMonitor};
pub use validator::{ControlCommand, Validator};
