//! Transport frame codecs
//!
//! Every function here is pure: bytes in, frames or errors out.

pub mod can;
pub mod isotp;
pub mod j1850;
pub mod kwp;

use crate::error::ProtocolError;
use crate::protocol::{Transport, TransportFamily};
use serde::{Deserialize, Serialize};

pub use can::CanFrame;
pub use isotp::{FlowStatus, IsoTpFrame, Reassembler, Reassembly};
pub use j1850::{J1850Frame, J1850Variant};
pub use kwp::{KLineFrame, KLineStyle};

/// One frame on any of the supported transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportFrame {
    Can(CanFrame),
    J1850(J1850Frame),
    KLine(KLineFrame),
}

impl TransportFrame {
    /// Adapter byte layout
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TransportFrame::Can(frame) => frame.to_bytes(),
            TransportFrame::J1850(frame) => frame.to_bytes(),
            TransportFrame::KLine(frame) => frame.to_bytes(),
        }
    }

    /// Decode adapter bytes as a frame of `transport`
    pub fn decode(transport: Transport, bytes: &[u8]) -> Result<Self, ProtocolError> {
        match transport.family() {
            TransportFamily::Can => CanFrame::from_bytes(bytes).map(TransportFrame::Can),
            TransportFamily::J1850 => J1850Frame::from_bytes(bytes).map(TransportFrame::J1850),
            TransportFamily::KLine => {
                KLineFrame::decode(kline_style(transport), bytes).map(TransportFrame::KLine)
            }
        }
    }

    /// Checksum byte carried by the frame, if the transport has one
    pub fn checksum(&self) -> Option<u8> {
        match self {
            TransportFrame::KLine(frame) => Some(frame.checksum),
            _ => None,
        }
    }
}

/// J1850 modulation of a J1850 transport
pub fn j1850_variant(transport: Transport) -> J1850Variant {
    match transport {
        Transport::J1850Pwm => J1850Variant::Pwm,
        _ => J1850Variant::Vpw,
    }
}

/// K-line header style of a K-line transport
pub fn kline_style(transport: Transport) -> KLineStyle {
    if transport.is_kwp() {
        KLineStyle::Kwp2000
    } else {
        KLineStyle::Iso9141
    }
}

/// Encode a service payload into the frames to transmit, in order.
///
/// CAN requests go to the functional id, ISO-TP segmented and padded to
/// eight bytes. A multi-frame CAN request must wait for Flow Control after
/// the first frame; the caller owns that exchange.
pub fn encode_request(
    transport: Transport,
    payload: &[u8],
) -> Result<Vec<TransportFrame>, ProtocolError> {
    match transport.family() {
        TransportFamily::Can => {
            let id = can::functional_request_id(transport.is_extended_id());
            isotp::segment(payload)?
                .into_iter()
                .map(|pdu| CanFrame::padded(id, pdu.to_bytes()).map(TransportFrame::Can))
                .collect()
        }
        TransportFamily::J1850 => Ok(vec![TransportFrame::J1850(J1850Frame::request(
            j1850_variant(transport),
            payload,
        )?)]),
        TransportFamily::KLine => Ok(vec![TransportFrame::KLine(KLineFrame::request(
            kline_style(transport),
            payload,
        )?)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_can_request() {
        let frames = encode_request(Transport::Iso15765_4Can11bit500, &[0x01, 0x00]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].to_bytes(),
            vec![0x00, 0x00, 0x07, 0xDF, 0x02, 0x01, 0x00, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_encode_29bit_request() {
        let frames = encode_request(Transport::Iso15765_4Can29bit500, &[0x03]).unwrap();
        assert_eq!(&frames[0].to_bytes()[..6], &[0x18, 0xDB, 0x33, 0xF1, 0x01, 0x03]);
    }

    #[test]
    fn test_encode_kline_request_has_checksum() {
        let frames = encode_request(Transport::Iso9141_2, &[0x01, 0x00]).unwrap();
        let bytes = frames[0].to_bytes();
        assert!(kwp::verify_checksum(&bytes).is_ok());
        assert_eq!(frames[0].checksum(), bytes.last().copied());
    }

    #[test]
    fn test_decode_dispatches_on_family() {
        let frame = TransportFrame::decode(
            Transport::J1850Pwm,
            &[0x41, 0x6B, 0x10, 0x41, 0x0D, 0x32],
        )
        .unwrap();
        assert!(matches!(frame, TransportFrame::J1850(_)));
        assert_eq!(frame.checksum(), None);
    }
}
