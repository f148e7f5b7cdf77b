//! OBD-II Protocol Implementation
//!
//! Pure encoding and decoding for the OBD-II transports: CAN with ISO-TP
//! segmentation, SAE J1850 PWM/VPW, ISO 9141-2 and ISO 14230-4 (KWP2000).
//! Also holds the shared PID conversion table and DTC formatting rules.
//! Nothing in this crate performs I/O.

pub mod codec;
mod dtc;
mod error;
mod message;
mod pid;
mod protocol;

pub use codec::TransportFrame;
pub use dtc::{decode_dtc_pairs, format_dtc, parse_dtc, DtcCategory, DtcEntry, FreezeFrame};
pub use error::ProtocolError;
pub use message::{ParameterRequest, ParameterResponse};
pub use pid::{
    decode_pid, decode_supported_pids, is_support_pid, lookup_pid, Pid, PidDefinition, PidValue,
    PID_TABLE,
};
pub use protocol::{Transport, TransportFamily};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
    /// Offset added to the request mode in a positive response
    pub const RESPONSE_OFFSET: u8 = 0x40;
    /// Service id of a negative response
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Milliseconds since the Unix epoch, zero if the clock is before it.
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
