//! K-line frames for ISO 9141-2 and ISO 14230-4 (KWP2000)
//!
//! Layout: header bytes, service id, service data, then an additive
//! checksum over everything before it.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// ISO 9141-2 request header (priority, target, source)
pub const ISO9141_REQUEST_HEADER: [u8; 3] = [0x68, 0x6A, 0xF1];
/// ISO 9141-2 data bytes per frame (service id included)
pub const ISO9141_MAX_DATA: usize = 7;
/// KWP2000 functional target address
pub const KWP_FUNCTIONAL_TARGET: u8 = 0x33;
/// Off-board tester address
pub const TESTER_ADDRESS: u8 = 0xF1;
/// KWP2000 data bytes that fit in the format byte length field
pub const KWP_SHORT_MAX: usize = 0x3F;
/// KWP2000 data bytes per frame with a separate length byte
pub const KWP_MAX_DATA: usize = 0xFF;

const KWP_FORMAT_ADDRESSED: u8 = 0xC0;
const KWP_ADDRESS_BITS: u8 = 0x80;

/// Header style of a K-line frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KLineStyle {
    Iso9141,
    Kwp2000,
}

/// A K-line frame with its checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KLineFrame {
    pub header: Vec<u8>,
    pub service_id: u8,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

/// Additive checksum: sum of all bytes modulo 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &x| acc.wrapping_add(x))
}

/// Check the trailing checksum byte of a raw frame
pub fn verify_checksum(frame: &[u8]) -> Result<(), ProtocolError> {
    let (&actual, body) = frame
        .split_last()
        .ok_or_else(|| ProtocolError::MalformedFrame("empty K-line frame".into()))?;
    let expected = checksum(body);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

impl KLineFrame {
    /// Build a request frame; `data` starts with the service id
    pub fn request(style: KLineStyle, data: &[u8]) -> Result<Self, ProtocolError> {
        let (&service_id, payload) = data
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedFrame("empty K-line payload".into()))?;

        let header = match style {
            KLineStyle::Iso9141 => {
                if data.len() > ISO9141_MAX_DATA {
                    return Err(ProtocolError::PayloadTooLong {
                        len: data.len(),
                        max: ISO9141_MAX_DATA,
                    });
                }
                ISO9141_REQUEST_HEADER.to_vec()
            }
            KLineStyle::Kwp2000 => {
                if data.len() > KWP_MAX_DATA {
                    return Err(ProtocolError::PayloadTooLong {
                        len: data.len(),
                        max: KWP_MAX_DATA,
                    });
                }
                if data.len() <= KWP_SHORT_MAX {
                    vec![
                        KWP_FORMAT_ADDRESSED | data.len() as u8,
                        KWP_FUNCTIONAL_TARGET,
                        TESTER_ADDRESS,
                    ]
                } else {
                    vec![
                        KWP_FORMAT_ADDRESSED,
                        KWP_FUNCTIONAL_TARGET,
                        TESTER_ADDRESS,
                        data.len() as u8,
                    ]
                }
            }
        };

        let mut frame = Self {
            header,
            service_id,
            payload: payload.to_vec(),
            checksum: 0,
        };
        frame.checksum = checksum(&frame.body_bytes());
        Ok(frame)
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + 1 + self.payload.len());
        out.extend_from_slice(&self.header);
        out.push(self.service_id);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Wire bytes including the checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.body_bytes();
        out.push(self.checksum);
        out
    }

    /// Service id and data, without header or checksum
    pub fn service_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.service_id);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a received frame. The checksum is recomputed and a mismatch is
    /// reported, never corrected.
    pub fn decode(style: KLineStyle, bytes: &[u8]) -> Result<Self, ProtocolError> {
        verify_checksum(bytes)?;
        let (&checksum, body) = bytes
            .split_last()
            .ok_or_else(|| ProtocolError::MalformedFrame("empty K-line frame".into()))?;

        let header_len = match style {
            KLineStyle::Iso9141 => ISO9141_REQUEST_HEADER.len(),
            KLineStyle::Kwp2000 => {
                let format = *body
                    .first()
                    .ok_or_else(|| ProtocolError::MalformedFrame("missing format byte".into()))?;
                let mut len = 1;
                if format & KWP_ADDRESS_BITS != 0 {
                    len += 2;
                }
                if format & 0x3F == 0 {
                    len += 1;
                }
                len
            }
        };

        if body.len() <= header_len {
            return Err(ProtocolError::MalformedFrame(format!(
                "K-line frame of {} bytes has no service id",
                bytes.len()
            )));
        }
        let (header, data) = body.split_at(header_len);

        match style {
            KLineStyle::Iso9141 => {
                if data.len() > ISO9141_MAX_DATA {
                    return Err(ProtocolError::PayloadTooLong {
                        len: data.len(),
                        max: ISO9141_MAX_DATA,
                    });
                }
            }
            KLineStyle::Kwp2000 => {
                let short_len = (header[0] & 0x3F) as usize;
                let declared = if short_len == 0 {
                    header[header_len - 1] as usize
                } else {
                    short_len
                };
                if declared != data.len() {
                    return Err(ProtocolError::LengthMismatch {
                        declared,
                        actual: data.len(),
                    });
                }
            }
        }

        Ok(Self {
            header: header.to_vec(),
            service_id: data[0],
            payload: data[1..].to_vec(),
            checksum,
        })
    }
}
