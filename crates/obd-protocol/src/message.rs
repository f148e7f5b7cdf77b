//! OBD-II request and response messages

use crate::error::ProtocolError;
use crate::mode;
use serde::{Deserialize, Serialize};

/// Largest data field of a Mode 01/02 response
pub const MAX_PID_DATA: usize = 4;

/// A single diagnostic request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterRequest {
    pub mode: u8,
    pub pid: u8,
    /// Whether `pid` goes on the wire
    with_pid: bool,
}

impl ParameterRequest {
    /// Modes 03, 04, 07 and 0A take no PID; `pid` is ignored for them
    pub fn new(mode: u8, pid: u8) -> Self {
        let with_pid = !matches!(
            mode,
            mode::READ_DTC | mode::CLEAR_DTC | mode::PENDING_DTC | mode::PERMANENT_DTC
        );
        Self {
            mode,
            pid: if with_pid { pid } else { 0 },
            with_pid,
        }
    }

    /// Mode 01 live data request
    pub fn current(pid: u8) -> Self {
        Self::new(mode::CURRENT_DATA, pid)
    }

    /// Mode 02 freeze frame request (frame 0)
    pub fn freeze_frame(pid: u8) -> Self {
        Self::new(mode::FREEZE_FRAME, pid)
    }

    /// Request for a mode that takes no PID (03, 04, 07, 0A)
    pub fn service(mode: u8) -> Self {
        Self::new(mode, 0)
    }

    /// Status query for one stored code: Mode 07 carrying the low byte of
    /// the raw code. The answer is `47 <low> <status>`.
    pub fn dtc_status(raw_code: u16) -> Self {
        Self {
            mode: mode::PENDING_DTC,
            pid: raw_code as u8,
            with_pid: true,
        }
    }

    /// Whether the request carries a PID byte
    pub fn has_pid(&self) -> bool {
        self.with_pid
    }

    /// Whether the response carries trouble code pairs
    pub fn is_dtc_mode(&self) -> bool {
        !self.with_pid
            && matches!(
                self.mode,
                mode::READ_DTC | mode::PENDING_DTC | mode::PERMANENT_DTC
            )
    }

    /// Service payload sent on the wire
    pub fn to_payload(&self) -> Vec<u8> {
        match self.mode {
            mode::FREEZE_FRAME => vec![self.mode, self.pid, 0x00],
            _ if self.has_pid() => vec![self.mode, self.pid],
            _ => vec![self.mode],
        }
    }

    /// Service id of a positive response
    pub fn response_mode(&self) -> u8 {
        self.mode.wrapping_add(mode::RESPONSE_OFFSET)
    }

    /// Parse a reassembled service response (service id first) into a
    /// [`ParameterResponse`].
    ///
    /// `strip_dtc_count` drops the leading DTC count byte that CAN ECUs put
    /// in front of Mode 03/07/0A data.
    pub fn parse_response(
        &self,
        service: &[u8],
        checksum: Option<u8>,
        strip_dtc_count: bool,
    ) -> Result<ParameterResponse, ProtocolError> {
        let (&sid, rest) = service
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedFrame("empty service response".into()))?;

        if sid == mode::NEGATIVE_RESPONSE {
            return Err(ProtocolError::NegativeResponse {
                service: rest.first().copied().unwrap_or(self.mode),
                code: rest.get(1).copied().unwrap_or(0),
            });
        }
        if sid != self.response_mode() {
            return Err(ProtocolError::UnexpectedResponse {
                expected: self.response_mode(),
                actual: sid,
            });
        }

        let payload = if self.has_pid() {
            let (&pid, data) = rest.split_first().ok_or_else(|| {
                ProtocolError::MalformedFrame(format!("mode {:02X} response without PID", sid))
            })?;
            if pid != self.pid {
                return Err(ProtocolError::UnexpectedResponse {
                    expected: self.pid,
                    actual: pid,
                });
            }
            let data = if self.mode == mode::FREEZE_FRAME {
                // Frame number precedes the data
                data.get(1..).unwrap_or(&[])
            } else {
                data
            };
            if matches!(self.mode, mode::CURRENT_DATA | mode::FREEZE_FRAME)
                && data.len() > MAX_PID_DATA
            {
                return Err(ProtocolError::PayloadTooLong {
                    len: data.len(),
                    max: MAX_PID_DATA,
                });
            }
            data
        } else if self.is_dtc_mode() && strip_dtc_count {
            rest.get(1..).unwrap_or(&[])
        } else {
            rest
        };

        Ok(ParameterResponse {
            mode: self.mode,
            pid: self.pid,
            payload: payload.to_vec(),
            checksum,
        })
    }
}

/// A decoded positive response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterResponse {
    /// Request mode (the wire carries mode + 0x40)
    pub mode: u8,
    pub pid: u8,
    /// Data bytes after the mode/PID echo
    pub payload: Vec<u8>,
    /// Frame checksum on transports that carry one
    pub checksum: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads() {
        assert_eq!(ParameterRequest::current(0x0C).to_payload(), vec![0x01, 0x0C]);
        assert_eq!(ParameterRequest::freeze_frame(0x05).to_payload(), vec![0x02, 0x05, 0x00]);
        assert_eq!(ParameterRequest::service(0x03).to_payload(), vec![0x03]);
        assert_eq!(ParameterRequest::service(0x04).to_payload(), vec![0x04]);
        assert_eq!(ParameterRequest::service(0x07).to_payload(), vec![0x07]);
        assert_eq!(ParameterRequest::dtc_status(0x0123).to_payload(), vec![0x07, 0x23]);
    }

    #[test]
    fn test_parse_dtc_status() {
        let response = ParameterRequest::dtc_status(0x0123)
            .parse_response(&[0x47, 0x23, 0x08], None, true)
            .unwrap();
        assert_eq!(response.payload, vec![0x08]);
    }

    #[test]
    fn test_parse_current_data() {
        let response = ParameterRequest::current(0x0C)
            .parse_response(&[0x41, 0x0C, 0x20, 0x00], None, true)
            .unwrap();
        assert_eq!(response.payload, vec![0x20, 0x00]);
        assert_eq!(response.mode, 0x01);
    }

    #[test]
    fn test_parse_freeze_frame_skips_frame_number() {
        let response = ParameterRequest::freeze_frame(0x05)
            .parse_response(&[0x42, 0x05, 0x00, 0x7B], None, true)
            .unwrap();
        assert_eq!(response.payload, vec![0x7B]);
    }

    #[test]
    fn test_parse_dtc_count_stripped_on_can() {
        let request = ParameterRequest::service(0x03);
        let can = request
            .parse_response(&[0x43, 0x01, 0x01, 0x23], None, true)
            .unwrap();
        assert_eq!(can.payload, vec![0x01, 0x23]);
        let kline = request
            .parse_response(&[0x43, 0x01, 0x23, 0x00, 0x00, 0x00, 0x00], Some(0x55), false)
            .unwrap();
        assert_eq!(kline.payload, vec![0x01, 0x23, 0, 0, 0, 0]);
        assert_eq!(kline.checksum, Some(0x55));
    }

    #[test]
    fn test_negative_and_mismatched_responses() {
        let request = ParameterRequest::current(0x0C);
        assert_eq!(
            request.parse_response(&[0x7F, 0x01, 0x12], None, true),
            Err(ProtocolError::NegativeResponse {
                service: 0x01,
                code: 0x12
            })
        );
        assert!(matches!(
            request.parse_response(&[0x41, 0x0D, 0x10], None, true),
            Err(ProtocolError::UnexpectedResponse { expected: 0x0C, actual: 0x0D })
        ));
        assert!(matches!(
            request.parse_response(&[0x41, 0x0C, 1, 2, 3, 4, 5], None, true),
            Err(ProtocolError::PayloadTooLong { .. })
        ));
    }
}
