//! Diagnostic Trouble Codes
//!
//! A DTC is two bytes on the wire. The top two bits select the system
//! letter and the remaining 14 bits print as four hex digits.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// DTC system, from the top two bits of the raw code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    /// P: engine and transmission
    Powertrain,
    /// C: chassis
    Chassis,
    /// B: body
    Body,
    /// U: network and vehicle integration
    Network,
}

impl DtcCategory {
    pub fn from_raw(raw: u16) -> Self {
        match raw >> 14 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn bits(&self) -> u16 {
        match self {
            DtcCategory::Powertrain => 0,
            DtcCategory::Chassis => 1,
            DtcCategory::Body => 2,
            DtcCategory::Network => 3,
        }
    }
}

/// Format a raw code as five characters, e.g. 0x0123 -> "P0123"
pub fn format_dtc(raw: u16) -> String {
    format!("{}{:04X}", DtcCategory::from_raw(raw).letter(), raw & 0x3FFF)
}

/// Parse five-character DTC text back into the raw code
pub fn parse_dtc(text: &str) -> Result<u16, ProtocolError> {
    let invalid = || ProtocolError::InvalidDtc(text.to_string());
    let mut chars = text.chars();
    let category = match chars.next().map(|c| c.to_ascii_uppercase()) {
        Some('P') => DtcCategory::Powertrain,
        Some('C') => DtcCategory::Chassis,
        Some('B') => DtcCategory::Body,
        Some('U') => DtcCategory::Network,
        _ => return Err(invalid()),
    };
    let digits = chars.as_str();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let low = u16::from_str_radix(digits, 16).map_err(|_| invalid())?;
    if low > 0x3FFF {
        return Err(invalid());
    }
    Ok((category.bits() << 14) | low)
}

/// Split a Mode 03/07/0A payload into raw codes, two bytes each.
///
/// 0x0000 entries are padding and skipped. A dangling odd byte means the
/// payload was cut short.
pub fn decode_dtc_pairs(payload: &[u8]) -> Result<Vec<u16>, ProtocolError> {
    if payload.len() % 2 != 0 {
        return Err(ProtocolError::MalformedFrame(format!(
            "DTC payload of {} bytes is not a whole number of codes",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .filter(|&raw| raw != 0)
        .collect())
}

/// A stored trouble code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcEntry {
    /// Five-character code, e.g. "P0123"
    pub code: String,
    /// Raw two-byte value
    pub raw_code: u16,
    /// Status byte
    pub status: u8,
    /// When the code was read (Unix ms)
    pub timestamp_ms: u64,
}

impl DtcEntry {
    pub fn new(raw_code: u16, status: u8, timestamp_ms: u64) -> Self {
        Self {
            code: format_dtc(raw_code),
            raw_code,
            status,
            timestamp_ms,
        }
    }

    pub fn category(&self) -> DtcCategory {
        DtcCategory::from_raw(self.raw_code)
    }
}

impl fmt::Display for DtcEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {:02X})", self.code, self.status)
    }
}

/// One parameter captured when a DTC was stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeFrame {
    /// Code that triggered the capture
    pub triggering_dtc: String,
    /// Parameter id
    pub pid: u8,
    /// Parameter name from the PID table
    pub name: String,
    /// Data bytes as received
    pub raw_bytes: Vec<u8>,
    /// Converted physical value
    pub value: f64,
    /// Unit of `value`
    pub unit: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_letter_mapping() {
        assert_eq!(format_dtc(0x0123), "P0123");
        assert_eq!(format_dtc(0x4123), "C0123");
        assert_eq!(format_dtc(0x8123), "B0123");
        assert_eq!(format_dtc(0xC123), "U0123");
        assert_eq!(format_dtc(0x3FFF), "P3FFF");
    }

    #[test]
    fn test_parse_dtc() {
        assert_eq!(parse_dtc("P0123"), Ok(0x0123));
        assert_eq!(parse_dtc("u0100"), Ok(0xC100));
        assert!(parse_dtc("P4000").is_err());
        assert!(parse_dtc("X0123").is_err());
        assert!(parse_dtc("P012").is_err());
        assert!(parse_dtc("P01G3").is_err());
    }

    #[test]
    fn test_pairs_skip_zero_padding() {
        assert_eq!(decode_dtc_pairs(&[0x01, 0x23, 0x00, 0x00]), Ok(vec![0x0123]));
        assert_eq!(decode_dtc_pairs(&[]), Ok(vec![]));
        assert!(decode_dtc_pairs(&[0x01, 0x23, 0x01]).is_err());
    }

    proptest! {
        #[test]
        fn prop_format_shape_and_letter(raw in any::<u16>()) {
            let code = format_dtc(raw);
            prop_assert_eq!(code.len(), 5);
            let mut chars = code.chars();
            let letter = chars.next().unwrap();
            let expected = ['P', 'C', 'B', 'U'][(raw >> 14) as usize];
            prop_assert_eq!(letter, expected);
            prop_assert!(chars.all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
            prop_assert_eq!(parse_dtc(&code), Ok(raw));
        }
    }
}
