//! ISO-TP (ISO 15765-2) segmentation and reassembly
//!
//! Frames here are the CAN data field only; identifiers live in
//! [`super::can`].

use crate::error::ProtocolError;
use std::time::Duration;

/// Largest message a 12-bit First Frame length can describe
pub const MAX_MESSAGE_LEN: usize = 4095;
/// Payload bytes in a Single Frame
pub const SINGLE_FRAME_MAX: usize = 7;
/// Payload bytes in a First Frame
pub const FIRST_FRAME_DATA: usize = 6;
/// Payload bytes in a Consecutive Frame
pub const CONSECUTIVE_FRAME_DATA: usize = 7;

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// Flow status carried in a Flow Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

/// One ISO-TP protocol data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    Single { data: Vec<u8> },
    First { total_len: u16, data: Vec<u8> },
    Consecutive { seq: u8, data: Vec<u8> },
    FlowControl { status: FlowStatus, block_size: u8, st_min: u8 },
}

impl IsoTpFrame {
    /// Flow Control frame a receiver sends after a First Frame: send
    /// everything, no separation time.
    pub fn clear_to_send() -> Self {
        IsoTpFrame::FlowControl {
            status: FlowStatus::ContinueToSend,
            block_size: 0,
            st_min: 0,
        }
    }

    /// Parse a CAN data field. Trailing padding is ignored.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let pci = *data
            .first()
            .ok_or_else(|| ProtocolError::MalformedFrame("empty ISO-TP frame".into()))?;

        match pci & 0xF0 {
            PCI_SINGLE => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len > SINGLE_FRAME_MAX {
                    return Err(ProtocolError::MalformedFrame(format!(
                        "single frame length {len}"
                    )));
                }
                if data.len() < 1 + len {
                    return Err(ProtocolError::LengthMismatch {
                        declared: len,
                        actual: data.len() - 1,
                    });
                }
                Ok(IsoTpFrame::Single {
                    data: data[1..1 + len].to_vec(),
                })
            }
            PCI_FIRST => {
                if data.len() < 2 {
                    return Err(ProtocolError::MalformedFrame("truncated first frame".into()));
                }
                let total_len = (((pci & 0x0F) as u16) << 8) | data[1] as u16;
                if (total_len as usize) <= SINGLE_FRAME_MAX {
                    return Err(ProtocolError::MalformedFrame(format!(
                        "first frame declares only {total_len} bytes"
                    )));
                }
                let end = data.len().min(2 + FIRST_FRAME_DATA);
                Ok(IsoTpFrame::First {
                    total_len,
                    data: data[2..end].to_vec(),
                })
            }
            PCI_CONSECUTIVE => Ok(IsoTpFrame::Consecutive {
                seq: pci & 0x0F,
                data: data[1..].to_vec(),
            }),
            PCI_FLOW_CONTROL => {
                let status = match pci & 0x0F {
                    0 => FlowStatus::ContinueToSend,
                    1 => FlowStatus::Wait,
                    2 => FlowStatus::Overflow,
                    other => {
                        return Err(ProtocolError::MalformedFrame(format!(
                            "flow status {other}"
                        )))
                    }
                };
                Ok(IsoTpFrame::FlowControl {
                    status,
                    block_size: data.get(1).copied().unwrap_or(0),
                    st_min: data.get(2).copied().unwrap_or(0),
                })
            }
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown PCI type {other:02X}"
            ))),
        }
    }

    /// Encode to a CAN data field, unpadded
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            IsoTpFrame::Single { data } => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(PCI_SINGLE | data.len() as u8);
                out.extend_from_slice(data);
                out
            }
            IsoTpFrame::First { total_len, data } => {
                let mut out = Vec::with_capacity(2 + data.len());
                out.push(PCI_FIRST | ((total_len >> 8) as u8 & 0x0F));
                out.push(*total_len as u8);
                out.extend_from_slice(data);
                out
            }
            IsoTpFrame::Consecutive { seq, data } => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(PCI_CONSECUTIVE | (seq & 0x0F));
                out.extend_from_slice(data);
                out
            }
            IsoTpFrame::FlowControl {
                status,
                block_size,
                st_min,
            } => {
                let fs = match status {
                    FlowStatus::ContinueToSend => 0,
                    FlowStatus::Wait => 1,
                    FlowStatus::Overflow => 2,
                };
                vec![PCI_FLOW_CONTROL | fs, *block_size, *st_min]
            }
        }
    }
}

/// Split a message into ISO-TP frames: one Single Frame, or a First Frame
/// followed by Consecutive Frames numbered 1..15, 0, 1, ...
pub fn segment(message: &[u8]) -> Result<Vec<IsoTpFrame>, ProtocolError> {
    if message.is_empty() {
        return Err(ProtocolError::MalformedFrame("empty ISO-TP message".into()));
    }
    if message.len() > MAX_MESSAGE_LEN {
        return Err(ProtocolError::PayloadTooLong {
            len: message.len(),
            max: MAX_MESSAGE_LEN,
        });
    }
    if message.len() <= SINGLE_FRAME_MAX {
        return Ok(vec![IsoTpFrame::Single {
            data: message.to_vec(),
        }]);
    }

    let mut frames = Vec::with_capacity(1 + message.len() / CONSECUTIVE_FRAME_DATA);
    frames.push(IsoTpFrame::First {
        total_len: message.len() as u16,
        data: message[..FIRST_FRAME_DATA].to_vec(),
    });
    for (i, chunk) in message[FIRST_FRAME_DATA..]
        .chunks(CONSECUTIVE_FRAME_DATA)
        .enumerate()
    {
        frames.push(IsoTpFrame::Consecutive {
            seq: ((i + 1) & 0x0F) as u8,
            data: chunk.to_vec(),
        });
    }
    Ok(frames)
}

/// Progress of a [`Reassembler`] after accepting a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// A First Frame was accepted; the receiver must send Flow Control
    NeedFlowControl,
    /// More Consecutive Frames are expected
    InProgress,
    /// The message is complete
    Complete(Vec<u8>),
}

/// Receive-side ISO-TP state for one sender
#[derive(Debug, Default)]
pub struct Reassembler {
    expected_len: usize,
    buffer: Vec<u8>,
    next_seq: u8,
    active: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a multi-frame message is partially received
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one frame. Sequence gaps and stray frames are errors and reset
    /// the reassembler.
    pub fn push(&mut self, frame: IsoTpFrame) -> Result<Reassembly, ProtocolError> {
        match frame {
            IsoTpFrame::Single { data } => {
                if self.active {
                    self.reset();
                    return Err(ProtocolError::UnexpectedFrame(
                        "single frame during multi-frame reception".into(),
                    ));
                }
                Ok(Reassembly::Complete(data))
            }
            IsoTpFrame::First { total_len, data } => {
                if self.active {
                    self.reset();
                    return Err(ProtocolError::UnexpectedFrame(
                        "first frame during multi-frame reception".into(),
                    ));
                }
                self.expected_len = total_len as usize;
                self.buffer = Vec::with_capacity(self.expected_len);
                self.buffer.extend_from_slice(&data);
                self.next_seq = 1;
                self.active = true;
                Ok(Reassembly::NeedFlowControl)
            }
            IsoTpFrame::Consecutive { seq, data } => {
                if !self.active {
                    return Err(ProtocolError::UnexpectedFrame(
                        "consecutive frame without first frame".into(),
                    ));
                }
                if seq != self.next_seq {
                    let expected = self.next_seq;
                    self.reset();
                    return Err(ProtocolError::SequenceError {
                        expected,
                        actual: seq,
                    });
                }
                self.next_seq = (self.next_seq + 1) & 0x0F;

                let remaining = self.expected_len - self.buffer.len();
                let take = remaining.min(data.len());
                self.buffer.extend_from_slice(&data[..take]);

                if self.buffer.len() == self.expected_len {
                    self.active = false;
                    Ok(Reassembly::Complete(std::mem::take(&mut self.buffer)))
                } else {
                    Ok(Reassembly::InProgress)
                }
            }
            IsoTpFrame::FlowControl { .. } => Err(ProtocolError::UnexpectedFrame(
                "flow control frame on receive path".into(),
            )),
        }
    }

    /// Abandon any partial message
    pub fn reset(&mut self) {
        self.expected_len = 0;
        self.buffer.clear();
        self.next_seq = 0;
        self.active = false;
    }

    /// Bytes received so far versus declared length
    pub fn progress(&self) -> (usize, usize) {
        (self.buffer.len(), self.expected_len)
    }
}

/// Reassemble a complete frame sequence into one message.
///
/// Fails with [`ProtocolError::LengthMismatch`] when the frames run out
/// before the declared length is reached.
pub fn reassemble(frames: &[IsoTpFrame]) -> Result<Vec<u8>, ProtocolError> {
    let mut reassembler = Reassembler::new();
    for frame in frames {
        if let Reassembly::Complete(message) = reassembler.push(frame.clone())? {
            return Ok(message);
        }
    }
    let (actual, declared) = reassembler.progress();
    Err(ProtocolError::LengthMismatch { declared, actual })
}

/// Decode an STmin byte into a separation time.
///
/// 0x00-0x7F are milliseconds, 0xF1-0xF9 are 100-900 microseconds, and
/// reserved values are treated as the maximum 127 ms.
pub fn separation_time(st_min: u8) -> Duration {
    match st_min {
        0x00..=0x7F => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}
