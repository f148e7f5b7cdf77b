//! OBD-II Protocol Error Types

use thiserror::Error;

/// Errors raised while encoding or decoding OBD-II frames.
///
/// These are never retried: a frame that decodes to garbage will decode to
/// the same garbage the second time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Additive checksum mismatch on a K-line frame
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Frame bytes that cannot be parsed
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Declared length disagrees with the bytes actually received
    #[error("Length mismatch: declared {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// ISO-TP consecutive frame out of order
    #[error("ISO-TP sequence error: expected {expected:X}, got {actual:X}")]
    SequenceError { expected: u8, actual: u8 },

    /// A frame arrived that does not fit the current exchange
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Payload larger than the transport allows
    #[error("Payload of {len} bytes exceeds transport maximum of {max}")]
    PayloadTooLong { len: usize, max: usize },

    /// ECU answered with a negative response (7F sid nrc)
    #[error("Negative response to service {service:02X}: code {code:02X}")]
    NegativeResponse { service: u8, code: u8 },

    /// Response service or PID does not match the request
    #[error("Unexpected response: expected {expected:02X}, got {actual:02X}")]
    UnexpectedResponse { expected: u8, actual: u8 },

    /// PID is not in the conversion table
    #[error("PID {0:02X} has no known conversion")]
    UnknownPid(u8),

    /// Too few data bytes for the PID formula
    #[error("PID {pid:02X} needs {needed} data bytes, got {got}")]
    InsufficientData { pid: u8, needed: usize, got: usize },

    /// Text that is not a valid trouble code
    #[error("Invalid trouble code: {0}")]
    InvalidDtc(String),
}
