//! CAN frame layout for ISO 15765-4
//!
//! Adapters exchange CAN frames as a 4-byte big-endian arbitration id
//! followed by up to 8 data bytes, the PassThru message layout.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Functional (broadcast) request id, 11-bit
pub const OBD_FUNCTIONAL_ID: u32 = 0x7DF;
/// Functional (broadcast) request id, 29-bit
pub const OBD_FUNCTIONAL_ID_29: u32 = 0x18DB_33F1;
/// First ECU response id, 11-bit
pub const OBD_RESPONSE_ID_MIN: u32 = 0x7E8;
/// Last ECU response id, 11-bit
pub const OBD_RESPONSE_ID_MAX: u32 = 0x7EF;
/// Response id prefix for 29-bit ECUs answering the tester (0x18DAF1xx)
pub const OBD_RESPONSE_PREFIX_29: u32 = 0x18DA_F100;
/// Classic CAN data field size
pub const MAX_DATA_LEN: usize = 8;
/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

const ID_BYTES: usize = 4;

/// A single CAN frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// 11-bit or 29-bit arbitration id
    pub arbitration_id: u32,
    /// Data field (0-8 bytes)
    pub data: Vec<u8>,
    /// Whether the id is 29-bit
    pub extended_id: bool,
    /// Remote transmission request
    pub remote_frame: bool,
}

impl CanFrame {
    /// Create a data frame. Ids above 0x7FF are extended.
    pub fn new(arbitration_id: u32, data: Vec<u8>) -> Result<Self, ProtocolError> {
        if data.len() > MAX_DATA_LEN {
            return Err(ProtocolError::PayloadTooLong {
                len: data.len(),
                max: MAX_DATA_LEN,
            });
        }
        Ok(Self {
            arbitration_id,
            data,
            extended_id: arbitration_id > MAX_STANDARD_ID,
            remote_frame: false,
        })
    }

    /// Create a data frame padded to 8 bytes with 0x00
    pub fn padded(arbitration_id: u32, mut data: Vec<u8>) -> Result<Self, ProtocolError> {
        if data.len() < MAX_DATA_LEN {
            data.resize(MAX_DATA_LEN, 0x00);
        }
        Self::new(arbitration_id, data)
    }

    /// Data length code
    pub fn data_length(&self) -> u8 {
        self.data.len() as u8
    }

    /// Adapter byte layout: id (big-endian) then data
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ID_BYTES + self.data.len());
        out.extend_from_slice(&self.arbitration_id.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse the adapter byte layout
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < ID_BYTES {
            return Err(ProtocolError::MalformedFrame(format!(
                "CAN frame of {} bytes has no identifier",
                bytes.len()
            )));
        }
        let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self::new(id, bytes[ID_BYTES..].to_vec())
    }
}

/// Functional request id for the identifier width
pub fn functional_request_id(extended: bool) -> u32 {
    if extended {
        OBD_FUNCTIONAL_ID_29
    } else {
        OBD_FUNCTIONAL_ID
    }
}

/// Check if a CAN id is an OBD-II ECU response (0x7E8-0x7EF or 0x18DAF1xx)
pub fn is_obd_response(id: u32) -> bool {
    (OBD_RESPONSE_ID_MIN..=OBD_RESPONSE_ID_MAX).contains(&id)
        || (id & 0xFFFF_FF00) == OBD_RESPONSE_PREFIX_29
}

/// Physical request id of the ECU that sent `response_id`, used to address
/// Flow Control frames.
pub fn physical_request_id(response_id: u32) -> Option<u32> {
    if (OBD_RESPONSE_ID_MIN..=OBD_RESPONSE_ID_MAX).contains(&response_id) {
        Some(response_id - 8)
    } else if (response_id & 0xFFFF_FF00) == OBD_RESPONSE_PREFIX_29 {
        let ecu = response_id & 0xFF;
        Some(0x18DA_0000 | (ecu << 8) | 0xF1)
    } else {
        None
    }
}

/// Response id an ECU at `index` (0-7) answers with
pub fn response_id(extended: bool, index: u8) -> u32 {
    if extended {
        // ECU addresses 0x10, 0x18, ... by convention
        OBD_RESPONSE_PREFIX_29 | (0x10 + (index as u32 & 0x07) * 8)
    } else {
        OBD_RESPONSE_ID_MIN + (index as u32 & 0x07)
    }
}

/// Mask and pattern for a pass filter accepting every OBD response id
pub fn response_filter(extended: bool) -> (u32, u32) {
    if extended {
        (0xFFFF_FF00, OBD_RESPONSE_PREFIX_29)
    } else {
        (0xFFFF_FFF8, OBD_RESPONSE_ID_MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_layout() {
        let frame = CanFrame::padded(OBD_FUNCTIONAL_ID, vec![0x02, 0x01, 0x0C]).unwrap();
        assert_eq!(
            frame.to_bytes(),
            vec![0x00, 0x00, 0x07, 0xDF, 0x02, 0x01, 0x0C, 0, 0, 0, 0, 0]
        );
        assert!(!frame.extended_id);
        assert_eq!(frame.data_length(), 8);
        assert_eq!(CanFrame::from_bytes(&frame.to_bytes()).unwrap(), frame);
    }

    #[test]
    fn test_extended_id_detection() {
        let frame = CanFrame::new(OBD_FUNCTIONAL_ID_29, vec![0x01]).unwrap();
        assert!(frame.extended_id);
    }

    #[test]
    fn test_rejects_long_data() {
        assert!(CanFrame::new(0x7E0, vec![0; 9]).is_err());
        assert!(CanFrame::from_bytes(&[0x00, 0x07]).is_err());
    }

    #[test]
    fn test_response_ids() {
        assert!(is_obd_response(0x7E8));
        assert!(is_obd_response(0x7EF));
        assert!(!is_obd_response(0x7DF));
        assert!(is_obd_response(0x18DA_F110));
        assert_eq!(physical_request_id(0x7E8), Some(0x7E0));
        assert_eq!(physical_request_id(0x18DA_F110), Some(0x18DA_10F1));
        assert_eq!(physical_request_id(0x123), None);
        assert_eq!(response_id(true, 0), 0x18DA_F110);
    }
}
