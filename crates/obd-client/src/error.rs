//! Client Error Types

use obd_adapter::AdapterError;
use obd_protocol::{ProtocolError, Transport};
use obd_scheduler::MonitorError;
use safety_validator::{ConfigurationError, SafetyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One failed negotiation candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationAttempt {
    pub transport: Transport,
    pub error: String,
}

impl fmt::Display for NegotiationAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.transport, self.error)
    }
}

fn summarize(attempts: &[NegotiationAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidate transports".to_string();
    }
    attempts
        .iter()
        .map(NegotiationAttempt::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the client session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObdError {
    /// Adapter-level failure, fatal to the session
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Transport failure left after retries
    #[error("Transport failure on {transport} (mode {mode:02X}, PID {pid:02X}): {source}")]
    Transport {
        transport: Transport,
        mode: u8,
        pid: u8,
        source: AdapterError,
    },

    /// Frame or response that failed to decode; never retried
    #[error("Protocol error on {transport} (mode {mode:02X}, PID {pid:02X}): {source}; raw {raw:02X?}")]
    Protocol {
        transport: Transport,
        mode: u8,
        pid: u8,
        raw: Vec<u8>,
        source: ProtocolError,
    },

    #[error("Safety check failed: {0}")]
    Safety(#[from] SafetyError),

    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Protocol negotiation failed: {}", summarize(.attempts))]
    NegotiationFailed { attempts: Vec<NegotiationAttempt> },

    #[error("No transport negotiated")]
    NotNegotiated,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Monitoring error: {0}")]
    Monitor(#[from] MonitorError),
}

impl ObdError {
    /// Whether the session cannot continue
    pub fn is_fatal(&self) -> bool {
        match self {
            ObdError::Adapter(e) => e.is_fatal(),
            ObdError::Configuration(_) | ObdError::NegotiationFailed { .. } => true,
            _ => false,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ObdError::Transport { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, ObdError::Protocol { .. })
    }

    /// Protocol error carried by this error, if any
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            ObdError::Protocol { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type ObdResult<T> = Result<T, ObdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_in_messages() {
        let err = ObdError::Protocol {
            transport: Transport::Iso9141_2,
            mode: 0x01,
            pid: 0x0C,
            raw: vec![0x48, 0x6B],
            source: ProtocolError::ChecksumMismatch {
                expected: 0x10,
                actual: 0x11,
            },
        };
        let text = err.to_string();
        assert!(text.contains("ISO 9141-2"));
        assert!(text.contains("PID 0C"));
        assert!(text.contains("[48, 6B]"));
        assert!(err.is_protocol());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_negotiation_summary() {
        let err = ObdError::NegotiationFailed {
            attempts: vec![
                NegotiationAttempt {
                    transport: Transport::Iso15765_4Can11bit500,
                    error: "no response".into(),
                },
                NegotiationAttempt {
                    transport: Transport::Iso9141_2,
                    error: "timeout".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Protocol negotiation failed: ISO 15765-4 CAN 11/500: no response; ISO 9141-2: timeout"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_adapter_conversion() {
        let err: ObdError = AdapterError::OpenFailed("COM3".into()).into();
        assert!(err.is_fatal());
        let err: ObdError = AdapterError::Cancelled.into();
        assert!(!err.is_fatal());
    }
}
