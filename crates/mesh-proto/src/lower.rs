//! Lower-transport PDU formats (Mesh Profile §3.5.2).
//!
//! Access PDUs either fit a single network PDU (`SEG = 0`, up to 15 bytes
//! of upper-transport payload) or are segmented into 12-byte slices with a
//! 13-bit SeqZero and 5-bit SegO/SegN. Control PDUs carry a 7-bit opcode;
//! the segment acknowledgement (opcode `0x00`) reports received segments
//! in a 32-bit bitmap.

use mesh_core::{Address, Features};
use thiserror::Error;

/// Control opcode of the segment acknowledgement.
pub const OPCODE_SEGMENT_ACK: u8 = 0x00;

/// Control opcode of the heartbeat message.
pub const OPCODE_HEARTBEAT: u8 = 0x0A;

/// Upper-transport payload limit of an unsegmented access PDU.
pub const UNSEGMENTED_ACCESS_MAX: usize = 15;

/// Upper-transport bytes carried per access segment.
pub const ACCESS_SEGMENT_SIZE: usize = 12;

/// Payload bytes carried per control segment.
pub const CONTROL_SEGMENT_SIZE: usize = 8;

/// Parameter limit of an unsegmented control PDU.
pub const UNSEGMENTED_CONTROL_MAX: usize = 11;

/// SegN is 5 bits, so a message spans at most 32 segments.
pub const MAX_SEGMENTS: usize = 32;

/// Errors from lower-transport encoding and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LowerPduError {
    /// PDU shorter than its header
    #[error("PDU too short: {0} bytes")]
    TooShort(usize),

    /// Payload exceeds the format's limit
    #[error("Payload length {0} invalid for this PDU")]
    InvalidLength(usize),

    /// SegO, SegN or SeqZero out of range or inconsistent
    #[error("Invalid segmentation fields")]
    InvalidSegmentation,

    /// Control opcode above 0x7F
    #[error("Invalid control opcode 0x{0:02X}")]
    InvalidOpcode(u8),
}

/// A decoded lower-transport PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    /// Unsegmented access message. `aid` is `Some` when AKF is set.
    UnsegmentedAccess {
        /// AID of the application key, or `None` for device-key traffic.
        aid: Option<u8>,
        /// Encrypted upper-transport PDU, 1..=15 bytes.
        upper_pdu: Vec<u8>,
    },
    /// One segment of a segmented access message.
    SegmentedAccess {
        /// AID of the application key, or `None` for device-key traffic.
        aid: Option<u8>,
        /// Size flag of the access MIC: true selects the 64-bit MIC.
        szmic: bool,
        /// Low 13 bits of the first segment's sequence number.
        seq_zero: u16,
        /// Segment offset, 0..=seg_n.
        seg_o: u8,
        /// Last segment number.
        seg_n: u8,
        /// Up to 12 bytes of the upper-transport PDU.
        segment: Vec<u8>,
    },
    /// Segment acknowledgement control PDU.
    SegmentAck {
        /// On-behalf-of flag, set by friend nodes acking for their LPN.
        obo: bool,
        /// SeqZero of the message being acknowledged.
        seq_zero: u16,
        /// Bitmap of received segments; bit n set means SegO n arrived.
        block_ack: u32,
    },
    /// Unsegmented control message.
    UnsegmentedControl {
        /// 7-bit control opcode.
        opcode: u8,
        /// Up to 11 parameter bytes.
        parameters: Vec<u8>,
    },
    /// One segment of a segmented control message.
    SegmentedControl {
        /// 7-bit control opcode.
        opcode: u8,
        /// Low 13 bits of the first segment's sequence number.
        seq_zero: u16,
        /// Segment offset.
        seg_o: u8,
        /// Last segment number.
        seg_n: u8,
        /// Up to 8 payload bytes.
        segment: Vec<u8>,
    },
}

impl LowerTransportPdu {
    /// Encodes to the transport PDU bytes carried by the network layer.
    pub fn encode(&self) -> Result<Vec<u8>, LowerPduError> {
        match self {
            LowerTransportPdu::UnsegmentedAccess { aid, upper_pdu } => {
                if upper_pdu.is_empty() || upper_pdu.len() > UNSEGMENTED_ACCESS_MAX {
                    return Err(LowerPduError::InvalidLength(upper_pdu.len()));
                }
                let mut out = Vec::with_capacity(1 + upper_pdu.len());
                out.push(access_header(*aid, false));
                out.extend_from_slice(upper_pdu);
                Ok(out)
            }
            LowerTransportPdu::SegmentedAccess {
                aid,
                szmic,
                seq_zero,
                seg_o,
                seg_n,
                segment,
            } => {
                check_segment_fields(*seq_zero, *seg_o, *seg_n)?;
                if segment.is_empty() || segment.len() > ACCESS_SEGMENT_SIZE {
                    return Err(LowerPduError::InvalidLength(segment.len()));
                }
                let mut out = Vec::with_capacity(4 + segment.len());
                out.push(access_header(*aid, true));
                out.extend_from_slice(&segmentation_fields(*szmic, *seq_zero, *seg_o, *seg_n));
                out.extend_from_slice(segment);
                Ok(out)
            }
            LowerTransportPdu::SegmentAck {
                obo,
                seq_zero,
                block_ack,
            } => {
                if *seq_zero > 0x1FFF {
                    return Err(LowerPduError::InvalidSegmentation);
                }
                let mut out = Vec::with_capacity(7);
                out.push(OPCODE_SEGMENT_ACK);
                out.push(((*obo as u8) << 7) | (seq_zero >> 6) as u8);
                out.push(((seq_zero & 0x3F) << 2) as u8);
                out.extend_from_slice(&block_ack.to_be_bytes());
                Ok(out)
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                if *opcode > 0x7F || *opcode == OPCODE_SEGMENT_ACK {
                    return Err(LowerPduError::InvalidOpcode(*opcode));
                }
                if parameters.len() > UNSEGMENTED_CONTROL_MAX {
                    return Err(LowerPduError::InvalidLength(parameters.len()));
                }
                let mut out = Vec::with_capacity(1 + parameters.len());
                out.push(*opcode);
                out.extend_from_slice(parameters);
                Ok(out)
            }
            LowerTransportPdu::SegmentedControl {
                opcode,
                seq_zero,
                seg_o,
                seg_n,
                segment,
            } => {
                if *opcode > 0x7F || *opcode == OPCODE_SEGMENT_ACK {
                    return Err(LowerPduError::InvalidOpcode(*opcode));
                }
                check_segment_fields(*seq_zero, *seg_o, *seg_n)?;
                if segment.is_empty() || segment.len() > CONTROL_SEGMENT_SIZE {
                    return Err(LowerPduError::InvalidLength(segment.len()));
                }
                let mut out = Vec::with_capacity(4 + segment.len());
                out.push(0x80 | *opcode);
                out.extend_from_slice(&segmentation_fields(false, *seq_zero, *seg_o, *seg_n));
                out.extend_from_slice(segment);
                Ok(out)
            }
        }
    }

    /// Decodes a transport PDU. `ctl` comes from the network header.
    pub fn decode(ctl: bool, data: &[u8]) -> Result<Self, LowerPduError> {
        if data.is_empty() {
            return Err(LowerPduError::TooShort(0));
        }
        let seg = data[0] & 0x80 != 0;
        if ctl {
            let opcode = data[0] & 0x7F;
            match (seg, opcode) {
                (false, OPCODE_SEGMENT_ACK) => {
                    if data.len() != 7 {
                        return Err(LowerPduError::TooShort(data.len()));
                    }
                    let obo = data[1] & 0x80 != 0;
                    let seq_zero = (((data[1] & 0x7F) as u16) << 6) | (data[2] >> 2) as u16;
                    let block_ack =
                        u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
                    Ok(LowerTransportPdu::SegmentAck {
                        obo,
                        seq_zero,
                        block_ack,
                    })
                }
                (false, opcode) => {
                    let parameters = data[1..].to_vec();
                    if parameters.len() > UNSEGMENTED_CONTROL_MAX {
                        return Err(LowerPduError::InvalidLength(parameters.len()));
                    }
                    Ok(LowerTransportPdu::UnsegmentedControl { opcode, parameters })
                }
                (true, opcode) => {
                    let (_, seq_zero, seg_o, seg_n, segment) = decode_segment(data)?;
                    if segment.len() > CONTROL_SEGMENT_SIZE {
                        return Err(LowerPduError::InvalidLength(segment.len()));
                    }
                    Ok(LowerTransportPdu::SegmentedControl {
                        opcode,
                        seq_zero,
                        seg_o,
                        seg_n,
                        segment,
                    })
                }
            }
        } else {
            let aid = (data[0] & 0x40 != 0).then_some(data[0] & 0x3F);
            if seg {
                let (szmic, seq_zero, seg_o, seg_n, segment) = decode_segment(data)?;
                if segment.len() > ACCESS_SEGMENT_SIZE {
                    return Err(LowerPduError::InvalidLength(segment.len()));
                }
                Ok(LowerTransportPdu::SegmentedAccess {
                    aid,
                    szmic,
                    seq_zero,
                    seg_o,
                    seg_n,
                    segment,
                })
            } else {
                let upper_pdu = data[1..].to_vec();
                if upper_pdu.is_empty() || upper_pdu.len() > UNSEGMENTED_ACCESS_MAX {
                    return Err(LowerPduError::InvalidLength(upper_pdu.len()));
                }
                Ok(LowerTransportPdu::UnsegmentedAccess { aid, upper_pdu })
            }
        }
    }
}

fn access_header(aid: Option<u8>, seg: bool) -> u8 {
    let mut byte = (seg as u8) << 7;
    if let Some(aid) = aid {
        byte |= 0x40 | (aid & 0x3F);
    }
    byte
}

fn check_segment_fields(seq_zero: u16, seg_o: u8, seg_n: u8) -> Result<(), LowerPduError> {
    if seq_zero > 0x1FFF || seg_n >= MAX_SEGMENTS as u8 || seg_o > seg_n {
        return Err(LowerPduError::InvalidSegmentation);
    }
    Ok(())
}

/// Packs `SZMIC(1) ‖ SeqZero(13) ‖ SegO(5) ‖ SegN(5)` into three bytes.
fn segmentation_fields(szmic: bool, seq_zero: u16, seg_o: u8, seg_n: u8) -> [u8; 3] {
    [
        ((szmic as u8) << 7) | (seq_zero >> 6) as u8,
        (((seq_zero & 0x3F) << 2) as u8) | (seg_o >> 3),
        ((seg_o & 0x07) << 5) | (seg_n & 0x1F),
    ]
}

fn decode_segment(data: &[u8]) -> Result<(bool, u16, u8, u8, Vec<u8>), LowerPduError> {
    if data.len() < 5 {
        return Err(LowerPduError::TooShort(data.len()));
    }
    let szmic = data[1] & 0x80 != 0;
    let seq_zero = (((data[1] & 0x7F) as u16) << 6) | (data[2] >> 2) as u16;
    let seg_o = ((data[2] & 0x03) << 3) | (data[3] >> 5);
    let seg_n = data[3] & 0x1F;
    if seg_o > seg_n {
        return Err(LowerPduError::InvalidSegmentation);
    }
    Ok((szmic, seq_zero, seg_o, seg_n, data[4..].to_vec()))
}

/// Reconstructs the full 24-bit sequence number a SeqZero refers to, given
/// the sequence number of the PDU that carried the segment.
///
/// SeqZero is the low 13 bits of the first segment's sequence number;
/// later segments carry larger sequence numbers, at most 8191 apart.
pub fn seq_from_seq_zero(seq: u32, seq_zero: u16) -> u32 {
    let low = seq & 0x1FFF;
    let seq_zero = seq_zero as u32;
    if low >= seq_zero {
        seq - (low - seq_zero)
    } else {
        seq.wrapping_sub(low + 0x2000 - seq_zero)
    }
}

/// The reassembly key: IV-Index and the reconstructed first sequence number.
///
/// ```text
/// SeqAuth = (IVIndex << 24) | seq
/// ```
pub fn seq_auth(iv_index: u32, seq: u32) -> u64 {
    ((iv_index as u64) << 24) | seq as u64
}

/// Heartbeat control message (opcode `0x0A`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// TTL the heartbeat was sent with; the receiver derives hop count
    /// from the difference to the received TTL.
    pub init_ttl: u8,
    /// Active features of the sending node.
    pub features: Features,
}

impl Heartbeat {
    /// Encodes to control-PDU parameters.
    pub fn encode(&self) -> [u8; 3] {
        let features = self.features.bits().to_be_bytes();
        [self.init_ttl & 0x7F, features[0], features[1]]
    }

    /// Decodes control-PDU parameters.
    pub fn decode(parameters: &[u8]) -> Result<Self, LowerPduError> {
        if parameters.len() != 3 {
            return Err(LowerPduError::TooShort(parameters.len()));
        }
        Ok(Self {
            init_ttl: parameters[0] & 0x7F,
            features: Features(u16::from_be_bytes([parameters[1], parameters[2]])),
        })
    }
}

/// Hop count of a received heartbeat, from its initial and received TTL.
pub fn heartbeat_hops(init_ttl: u8, received_ttl: u8) -> u8 {
    init_ttl.saturating_sub(received_ttl).saturating_add(1)
}

/// SeqZero of a message whose first segment is sent with `seq`.
pub fn seq_zero_of(seq: u32) -> u16 {
    (seq & 0x1FFF) as u16
}
