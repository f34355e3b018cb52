//! ISO-TP (ISO 15765-2) segmentation over the adapter's text channel
//!
//! Payloads up to 4095 bytes are cut into 8-byte CAN frames: a single frame
//! for up to 7 bytes, otherwise a first frame carrying the total length and
//! 6 bytes followed by consecutive frames of up to 7 bytes each. Frames travel
//! as uppercase hex text lines because the adapter only carries text.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::ProtocolError;

/// Payload bytes in a single or consecutive frame
pub const MAX_FRAME_PAYLOAD: usize = 7;

/// Payload bytes in a first frame
pub const FIRST_FRAME_PAYLOAD: usize = 6;

/// Largest payload expressible in the 12-bit length field
pub const MAX_PAYLOAD_LEN: usize = 4095;

/// Classic CAN data length
pub const CAN_FRAME_LEN: usize = 8;

/// Frame type carried in the high nibble of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Complete payload of up to seven bytes
    Single = 0,
    /// Start of a segmented payload
    First = 1,
    /// Continuation of a segmented payload
    Consecutive = 2,
    /// Receiver's answer to a first frame
    FlowControl = 3,
}

impl FrameType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(FrameType::Single),
            1 => Some(FrameType::First),
            2 => Some(FrameType::Consecutive),
            3 => Some(FrameType::FlowControl),
            _ => None,
        }
    }
}

/// Flow control status sent by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Keep sending consecutive frames
    ClearToSend,
    /// Pause before resuming
    Wait,
    /// Receiver cannot take the payload
    Overflow,
}

/// One ISO-TP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    /// Whole payload in one frame
    Single {
        /// Payload, at most seven bytes
        data: Vec<u8>,
    },
    /// Opens a segmented transfer
    First {
        /// Length of the whole payload
        total_len: u16,
        /// First six payload bytes
        data: Vec<u8>,
    },
    /// Carries the next part of a segmented transfer
    Consecutive {
        /// Sequence number, 1 to 15 then wrapping to 0
        sn: u8,
        /// Up to seven payload bytes
        data: Vec<u8>,
    },
    /// Receiver's go-ahead (or refusal) after a first frame
    FlowControl {
        /// Whether the sender may continue
        status: FlowStatus,
        /// Frames allowed before the next flow control, 0 for no limit
        block_size: u8,
        /// Minimum separation time between consecutive frames
        st_min: u8,
    },
}

impl IsoTpFrame {
    /// "Continue to send, no block limit, no separation time"
    pub fn clear_to_send() -> Self {
        IsoTpFrame::FlowControl {
            status: FlowStatus::ClearToSend,
            block_size: 0,
            st_min: 0,
        }
    }

    /// Type of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            IsoTpFrame::Single { .. } => FrameType::Single,
            IsoTpFrame::First { .. } => FrameType::First,
            IsoTpFrame::Consecutive { .. } => FrameType::Consecutive,
            IsoTpFrame::FlowControl { .. } => FrameType::FlowControl,
        }
    }

    /// Raw frame bytes, header included
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CAN_FRAME_LEN);
        match self {
            IsoTpFrame::Single { data } => {
                bytes.push(((FrameType::Single as u8) << 4) | (data.len() as u8 & 0x0F));
                bytes.extend_from_slice(data);
            }
            IsoTpFrame::First { total_len, data } => {
                bytes.push(((FrameType::First as u8) << 4) | ((total_len >> 8) as u8 & 0x0F));
                bytes.push((total_len & 0xFF) as u8);
                bytes.extend_from_slice(data);
            }
            IsoTpFrame::Consecutive { sn, data } => {
                bytes.push(((FrameType::Consecutive as u8) << 4) | (sn & 0x0F));
                bytes.extend_from_slice(data);
            }
            IsoTpFrame::FlowControl {
                status,
                block_size,
                st_min,
            } => {
                let flag = match status {
                    FlowStatus::ClearToSend => 0,
                    FlowStatus::Wait => 1,
                    FlowStatus::Overflow => 2,
                };
                bytes.push(((FrameType::FlowControl as u8) << 4) | flag);
                bytes.push(*block_size);
                bytes.push(*st_min);
            }
        }
        bytes
    }

    /// Parse raw frame bytes; trailing padding is ignored
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&pci, rest) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::InvalidFrame("empty frame".to_string()))?;
        if bytes.len() > CAN_FRAME_LEN {
            return Err(ProtocolError::InvalidFrame(format!(
                "{} bytes exceed a CAN frame",
                bytes.len()
            )));
        }

        let frame_type = FrameType::from_nibble(pci >> 4).ok_or_else(|| {
            ProtocolError::InvalidFrame(format!("unknown frame type {:#x}", pci >> 4))
        })?;
        let low = pci & 0x0F;

        match frame_type {
            FrameType::Single => {
                let len = low as usize;
                if len > MAX_FRAME_PAYLOAD || rest.len() < len {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "single frame announces {} bytes, carries {}",
                        len,
                        rest.len()
                    )));
                }
                Ok(IsoTpFrame::Single {
                    data: rest[..len].to_vec(),
                })
            }
            FrameType::First => {
                let (&low_len, data) = rest.split_first().ok_or_else(|| {
                    ProtocolError::InvalidFrame("first frame without length".to_string())
                })?;
                let total_len = ((low as u16) << 8) | low_len as u16;
                if (total_len as usize) <= MAX_FRAME_PAYLOAD {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "first frame for {} bytes fits a single frame",
                        total_len
                    )));
                }
                Ok(IsoTpFrame::First {
                    total_len,
                    data: data.to_vec(),
                })
            }
            FrameType::Consecutive => Ok(IsoTpFrame::Consecutive {
                sn: low,
                data: rest.to_vec(),
            }),
            FrameType::FlowControl => {
                let status = match low {
                    0 => FlowStatus::ClearToSend,
                    1 => FlowStatus::Wait,
                    2 => FlowStatus::Overflow,
                    other => {
                        return Err(ProtocolError::InvalidFrame(format!(
                            "unknown flow status {}",
                            other
                        )))
                    }
                };
                if rest.len() < 2 {
                    return Err(ProtocolError::InvalidFrame(
                        "truncated flow control frame".to_string(),
                    ));
                }
                Ok(IsoTpFrame::FlowControl {
                    status,
                    block_size: rest[0],
                    st_min: rest[1],
                })
            }
        }
    }

    /// Uppercase hex text of the frame, without delimiter
    pub fn to_hex(&self) -> String {
        encode_hex(&self.to_bytes())
    }

    /// Parse a hex text line (whitespace between bytes is allowed)
    pub fn from_hex(line: &str) -> Result<Self, ProtocolError> {
        Self::from_bytes(&decode_hex(line)?)
    }
}

/// Uppercase hex, two characters per byte
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Decode hex text, ignoring whitespace
pub fn decode_hex(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(ProtocolError::InvalidFrame(format!(
            "odd number of hex digits in {:?}",
            text
        )));
    }
    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| ProtocolError::InvalidFrame(format!("not hex: {:?}", text)))
        })
        .collect()
}

/// Cut `payload` into frames
pub fn segment(payload: &[u8]) -> Result<Vec<IsoTpFrame>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    if payload.len() <= MAX_FRAME_PAYLOAD {
        return Ok(vec![IsoTpFrame::Single {
            data: payload.to_vec(),
        }]);
    }

    let (head, tail) = payload.split_at(FIRST_FRAME_PAYLOAD);
    let mut frames = Vec::with_capacity(1 + tail.len().div_ceil(MAX_FRAME_PAYLOAD));
    frames.push(IsoTpFrame::First {
        total_len: payload.len() as u16,
        data: head.to_vec(),
    });
    for (i, chunk) in tail.chunks(MAX_FRAME_PAYLOAD).enumerate() {
        frames.push(IsoTpFrame::Consecutive {
            sn: ((i + 1) & 0x0F) as u8,
            data: chunk.to_vec(),
        });
    }
    Ok(frames)
}

/// How strictly a sender checks the receiver's answer to a first frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControlPolicy {
    /// Wait for the answer but accept anything, including nothing
    #[default]
    Relaxed,
    /// Require a ClearToSend flow control frame
    Strict,
}

impl FlowControlPolicy {
    /// Decide whether the answer lines grant continuation
    pub fn check(&self, lines: &[String]) -> Result<(), ProtocolError> {
        if *self == FlowControlPolicy::Relaxed {
            debug!("flow control (relaxed): {:?}", lines);
            return Ok(());
        }

        let frame = lines
            .iter()
            .filter_map(|line| IsoTpFrame::from_hex(line).ok())
            .find(|frame| frame.frame_type() == FrameType::FlowControl);
        match frame {
            Some(IsoTpFrame::FlowControl {
                status: FlowStatus::ClearToSend,
                ..
            }) => Ok(()),
            Some(IsoTpFrame::FlowControl { status, .. }) => Err(ProtocolError::FlowControl(
                format!("receiver answered {:?}", status),
            )),
            _ => Err(ProtocolError::FlowControl(format!(
                "no flow control frame in {:?}",
                lines
            ))),
        }
    }
}

/// Where serialized frames go
pub trait FrameSink {
    /// Transmit one frame as a hex text line
    fn send_line(&mut self, hex: &str) -> Result<(), ProtocolError>;

    /// Collect the receiver's answer to a first frame
    fn receive_flow_control(&mut self) -> Result<Vec<String>, ProtocolError>;
}

/// Segment `payload` and push the frames through `sink`, honoring flow control
pub fn segment_and_send<S: FrameSink + ?Sized>(
    payload: &[u8],
    sink: &mut S,
    policy: FlowControlPolicy,
) -> Result<usize, ProtocolError> {
    let frames = segment(payload)?;
    for frame in &frames {
        let hex = frame.to_hex();
        debug!("isotp tx: {}", hex);
        sink.send_line(&hex)?;
        if frame.frame_type() == FrameType::First {
            let answer = sink.receive_flow_control()?;
            policy.check(&answer)?;
        }
    }
    Ok(frames.len())
}

/// Result of feeding one frame to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// A whole payload is available
    Complete(Vec<u8>),
    /// A first frame arrived; the caller must grant flow control
    NeedFlowControl,
    /// More consecutive frames are needed
    InProgress,
}

#[derive(Debug)]
struct Transfer {
    total: usize,
    data: Vec<u8>,
    next_sn: u8,
}

/// Rebuilds payloads from inbound frames
#[derive(Debug, Default)]
pub struct IsoTpReassembler {
    transfer: Option<Transfer>,
}

impl IsoTpReassembler {
    /// Create an idle reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-frame payload is being collected
    pub fn in_progress(&self) -> bool {
        self.transfer.is_some()
    }

    /// Forget any partial payload
    pub fn reset(&mut self) {
        self.transfer = None;
    }

    /// Feed one frame.
    ///
    /// Consecutive frames must arrive in strict sequence order; a gap or a
    /// repeat aborts the partial payload with an error.
    pub fn push(&mut self, frame: IsoTpFrame) -> Result<Reassembly, ProtocolError> {
        match frame {
            IsoTpFrame::Single { data } => {
                if self.transfer.take().is_some() {
                    warn!("isotp: single frame aborted a multi-frame reception");
                }
                Ok(Reassembly::Complete(data))
            }
            IsoTpFrame::First { total_len, mut data } => {
                if self.transfer.take().is_some() {
                    warn!("isotp: first frame aborted a multi-frame reception");
                }
                let total = total_len as usize;
                data.truncate(total);
                self.transfer = Some(Transfer {
                    total,
                    data,
                    next_sn: 1,
                });
                Ok(Reassembly::NeedFlowControl)
            }
            IsoTpFrame::Consecutive { sn, data } => {
                let transfer = self.transfer.as_mut().ok_or_else(|| {
                    ProtocolError::UnexpectedFrame(format!(
                        "consecutive frame {:#x} without a first frame",
                        sn
                    ))
                })?;
                if sn != transfer.next_sn {
                    let expected = transfer.next_sn;
                    self.transfer = None;
                    return Err(ProtocolError::SequenceMismatch {
                        expected,
                        actual: sn,
                    });
                }

                let remaining = transfer.total - transfer.data.len();
                let take = remaining.min(data.len());
                transfer.data.extend_from_slice(&data[..take]);
                transfer.next_sn = (transfer.next_sn + 1) & 0x0F;

                if transfer.data.len() == transfer.total {
                    let done = self.transfer.take().map(|t| t.data).unwrap_or_default();
                    Ok(Reassembly::Complete(done))
                } else {
                    Ok(Reassembly::InProgress)
                }
            }
            IsoTpFrame::FlowControl { .. } => Err(ProtocolError::UnexpectedFrame(
                "flow control frame while receiving".to_string(),
            )),
        }
    }
}

/// Packs an outbound byte stream into full single frames.
///
/// Bytes are held back until seven are available so the bus carries full
/// frames; `flush` sends whatever is left.
#[derive(Debug, Default)]
pub struct IsoTpTxBuffer {
    pending: Vec<u8>,
}

impl IsoTpTxBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes, returning every frame that became full
    pub fn write(&mut self, data: &[u8]) -> Vec<IsoTpFrame> {
        self.pending.extend_from_slice(data);
        let full = self.pending.len() / MAX_FRAME_PAYLOAD * MAX_FRAME_PAYLOAD;
        let frames = self.pending[..full]
            .chunks(MAX_FRAME_PAYLOAD)
            .map(|chunk| IsoTpFrame::Single {
                data: chunk.to_vec(),
            })
            .collect();
        self.pending.drain(..full);
        frames
    }

    /// Emit the held-back bytes as one frame
    pub fn flush(&mut self) -> Option<IsoTpFrame> {
        if self.pending.is_empty() {
            return None;
        }
        Some(IsoTpFrame::Single {
            data: std::mem::take(&mut self.pending),
        })
    }

    /// Number of held-back bytes
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
