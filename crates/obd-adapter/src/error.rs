//! Device Adapter Error Types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// J2534 PassThru status codes, kept verbatim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassThruStatus {
    NoError,
    NotSupported,
    InvalidChannelId,
    InvalidProtocolId,
    NullParameter,
    Timeout,
    InvalidIoctl,
    BufferEmpty,
    BufferFull,
    /// Any code outside the table above
    Other(u32),
}

impl From<u32> for PassThruStatus {
    fn from(code: u32) -> Self {
        match code {
            0x00 => Self::NoError,
            0x01 => Self::NotSupported,
            0x02 => Self::InvalidChannelId,
            0x03 => Self::InvalidProtocolId,
            0x04 => Self::NullParameter,
            0x05 => Self::Timeout,
            0x06 => Self::InvalidIoctl,
            0x07 => Self::BufferEmpty,
            0x08 => Self::BufferFull,
            other => Self::Other(other),
        }
    }
}

impl PassThruStatus {
    pub fn code(&self) -> u32 {
        match self {
            Self::NoError => 0x00,
            Self::NotSupported => 0x01,
            Self::InvalidChannelId => 0x02,
            Self::InvalidProtocolId => 0x03,
            Self::NullParameter => 0x04,
            Self::Timeout => 0x05,
            Self::InvalidIoctl => 0x06,
            Self::BufferEmpty => 0x07,
            Self::BufferFull => 0x08,
            Self::Other(code) => *code,
        }
    }
}

impl fmt::Display for PassThruStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoError => "STATUS_NOERROR",
            Self::NotSupported => "ERR_NOT_SUPPORTED",
            Self::InvalidChannelId => "ERR_INVALID_CHANNEL_ID",
            Self::InvalidProtocolId => "ERR_INVALID_PROTOCOL_ID",
            Self::NullParameter => "ERR_NULL_PARAMETER",
            Self::Timeout => "ERR_TIMEOUT",
            Self::InvalidIoctl => "ERR_INVALID_IOCTL_ID",
            Self::BufferEmpty => "ERR_BUFFER_EMPTY",
            Self::BufferFull => "ERR_BUFFER_FULL",
            Self::Other(code) => return write!(f, "ERR_{:02X}", code),
        };
        f.write_str(text)
    }
}

/// Errors raised by device adapters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    /// Native interface library missing
    #[error("Interface library unavailable: {0}")]
    LibraryUnavailable(String),

    /// Device could not be opened
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    /// Device opened but did not initialize
    #[error("Device initialization failed: {0}")]
    InitializationFailed(String),

    /// Adapter configuration is unusable
    #[error("Invalid adapter configuration: {0}")]
    InvalidConfiguration(String),

    /// Firmware too old for the requested capability
    #[error("Incompatible firmware {found}, {required} or newer required")]
    IncompatibleFirmware { required: String, found: String },

    /// Adapter used before `initialize`
    #[error("Adapter not initialized")]
    NotInitialized,

    /// PassThru call failed with a J2534 status
    #[error("PassThru {op} failed: {status}")]
    PassThru {
        op: &'static str,
        status: PassThruStatus,
    },

    /// No frame within the timeout
    #[error("Timeout waiting for frame after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Vehicle did not answer
    #[error("No response from vehicle")]
    NoResponse,

    /// No channel open, or it was closed underneath the caller
    #[error("Channel closed")]
    ChannelClosed,

    /// Handle does not name the open channel
    #[error("Invalid channel handle {0}")]
    InvalidChannel(u32),

    /// Bus or protocol connection failed
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Serial or stream I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// In-flight operation aborted by an explicit channel close
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation not available on this device
    #[error("Not supported by this device: {0}")]
    Unsupported(String),
}

impl AdapterError {
    /// Transport-level failure worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Timeout { .. }
            | AdapterError::NoResponse
            | AdapterError::ChannelClosed
            | AdapterError::InvalidChannel(_)
            | AdapterError::ConnectFailed(_)
            | AdapterError::Io(_) => true,
            AdapterError::PassThru { status, .. } => matches!(
                status,
                PassThruStatus::Timeout
                    | PassThruStatus::BufferEmpty
                    | PassThruStatus::BufferFull
                    | PassThruStatus::InvalidChannelId
            ),
            _ => false,
        }
    }

    /// Failure that ends the session; no fallback is attempted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdapterError::LibraryUnavailable(_)
                | AdapterError::OpenFailed(_)
                | AdapterError::InitializationFailed(_)
                | AdapterError::InvalidConfiguration(_)
                | AdapterError::IncompatibleFirmware { .. }
                | AdapterError::NotInitialized
        )
    }

    /// Whether the channel must be reopened before the next attempt
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            AdapterError::ChannelClosed | AdapterError::InvalidChannel(_)
        ) || matches!(
            self,
            AdapterError::PassThru {
                status: PassThruStatus::InvalidChannelId,
                ..
            }
        )
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Io(err.to_string())
    }
}

impl From<tokio_serial::Error> for AdapterError {
    fn from(err: tokio_serial::Error) -> Self {
        AdapterError::OpenFailed(err.to_string())
    }
}

/// Result alias for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;
