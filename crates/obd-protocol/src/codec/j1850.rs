//! SAE J1850 PWM/VPW frames
//!
//! Three header bytes (priority/type, target, source) and up to eight data
//! bytes. The CRC is produced and checked by the interface hardware, so it
//! never appears here.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Header length in bytes
pub const HEADER_LEN: usize = 3;
/// Longest frame without CRC
pub const MAX_FRAME_LEN: usize = 11;
/// Largest payload (service id included)
pub const MAX_PAYLOAD: usize = MAX_FRAME_LEN - HEADER_LEN;
/// Functional target of OBD requests
pub const REQUEST_TARGET: u8 = 0x6A;
/// Functional target of OBD responses
pub const RESPONSE_TARGET: u8 = 0x6B;
/// Off-board tester address
pub const TESTER_ADDRESS: u8 = 0xF1;

/// J1850 modulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum J1850Variant {
    Pwm,
    Vpw,
}

impl J1850Variant {
    /// Priority/type byte of a request
    pub fn request_priority(&self) -> u8 {
        match self {
            J1850Variant::Pwm => 0x61,
            J1850Variant::Vpw => 0x68,
        }
    }
}

/// A J1850 frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct J1850Frame {
    pub priority: u8,
    pub target: u8,
    pub source: u8,
    /// Service id followed by service data
    pub payload: Vec<u8>,
}

impl J1850Frame {
    /// Build a functional OBD request. No segmentation exists on J1850, so
    /// anything over eight bytes is a caller error.
    pub fn request(variant: J1850Variant, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::MalformedFrame("empty J1850 payload".into()));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLong {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            priority: variant.request_priority(),
            target: REQUEST_TARGET,
            source: TESTER_ADDRESS,
            payload: payload.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&[self.priority, self.target, self.source]);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() <= HEADER_LEN {
            return Err(ProtocolError::MalformedFrame(format!(
                "J1850 frame of {} bytes has no payload",
                bytes.len()
            )));
        }
        if bytes.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::PayloadTooLong {
                len: bytes.len() - HEADER_LEN,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            priority: bytes[0],
            target: bytes[1],
            source: bytes[2],
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// Whether this frame is addressed to the tester as an OBD response
    pub fn is_response(&self) -> bool {
        self.target == RESPONSE_TARGET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers() {
        let pwm = J1850Frame::request(J1850Variant::Pwm, &[0x01, 0x0C]).unwrap();
        assert_eq!(pwm.to_bytes(), vec![0x61, 0x6A, 0xF1, 0x01, 0x0C]);
        let vpw = J1850Frame::request(J1850Variant::Vpw, &[0x01, 0x0C]).unwrap();
        assert_eq!(vpw.to_bytes(), vec![0x68, 0x6A, 0xF1, 0x01, 0x0C]);
    }

    #[test]
    fn test_payload_limit() {
        assert!(J1850Frame::request(J1850Variant::Vpw, &[0; 8]).is_ok());
        assert!(matches!(
            J1850Frame::request(J1850Variant::Vpw, &[0; 9]),
            Err(ProtocolError::PayloadTooLong { len: 9, max: 8 })
        ));
        assert!(J1850Frame::from_bytes(&[0x48, 0x6B, 0x10]).is_err());
        assert!(J1850Frame::from_bytes(&[0; 12]).is_err());
    }

    #[test]
    fn test_response_parse() {
        let frame = J1850Frame::from_bytes(&[0x48, 0x6B, 0x10, 0x41, 0x0D, 0x32]).unwrap();
        assert!(frame.is_response());
        assert_eq!(frame.source, 0x10);
        assert_eq!(frame.payload, vec![0x41, 0x0D, 0x32]);
    }
}
