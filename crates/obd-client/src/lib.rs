//! OBD-II Client
//!
//! Negotiates a transport with the vehicle, sends requests with bounded
//! retries and decodes live data, trouble codes and freeze frames. All
//! access goes through an explicit [`ObdClient`] session.

mod decoder;
mod engine;
mod error;
mod negotiator;
mod session;

pub use decoder::DiagnosticDecoder;
pub use engine::{ChannelCloser, EngineConfig, RequestEngine, RequestStatistics};
pub use error::{NegotiationAttempt, ObdError, ObdResult};
pub use negotiator::{
    Negotiated, NegotiationState, Negotiator, NegotiatorConfig, DEFAULT_ORDER, LEGACY_ORDER,
};
pub use session::{ClientConfig, ObdClient};

pub use obd_adapter as adapter;
pub use obd_protocol as protocol;
pub use obd_scheduler::{MonitorConfig, MonitorSample, Reading};
pub use safety_validator::{ControlCommand, SafetyError, SafetyLimits, Threshold};
