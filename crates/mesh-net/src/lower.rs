//! Segmentation and reassembly state machines (Mesh Profile §3.5.3).
//!
//! Outbound: every segment goes out at once; block-acks clear bits and
//! retransmit only what is missing; the acknowledgement timer drives full
//! retransmission rounds until the retry budget is spent. Inbound: one
//! reassembly entry per `(src, dst, SeqAuth)` accumulates segments, acks
//! unicast messages on a timer or on completion, and keeps a tombstone
//! that re-acks duplicates of an already delivered message.

use std::collections::HashMap;
use std::time::Duration;

use mesh_core::{Address, KeyIndex};
use mesh_proto::lower::{seq_auth, seq_from_seq_zero, LowerTransportPdu, ACCESS_SEGMENT_SIZE};
use tracing::{debug, trace};

use crate::access::MessageHandle;
use crate::timers::{TimerEvent, TimerHandle, TimerService};

/// Key of an inbound reassembly entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SarKey {
    /// Source of the segmented message.
    pub src: Address,
    /// Destination of the segmented message.
    pub dst: Address,
    /// SeqAuth of the message.
    pub seq_auth: u64,
}

/// Acknowledgement delay on the receiving side.
pub fn inbound_ack_delay(ttl: u8) -> Duration {
    Duration::from_millis(150 + 50 * ttl as u64)
}

/// Acknowledgement wait on the sending side before retransmitting.
pub fn outbound_ack_delay(ttl: u8) -> Duration {
    Duration::from_millis(200 + 50 * ttl as u64)
}

/// Reassembly tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReassemblyConfig {
    /// How long to wait for missing segments before dropping the entry.
    /// Clamped to at least 10 seconds.
    pub incomplete_timeout: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            incomplete_timeout: Duration::from_secs(10),
        }
    }
}

impl ReassemblyConfig {
    fn effective_incomplete_timeout(&self) -> Duration {
        self.incomplete_timeout.max(Duration::from_secs(10))
    }
}

/// A block-ack the manager should seal and transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAckAction {
    /// Local element sending the ack (the message destination).
    pub src: Address,
    /// The peer that sent the segments.
    pub dst: Address,
    /// Network key to seal the ack with.
    pub network_key: KeyIndex,
    /// SeqZero being acknowledged.
    pub seq_zero: u16,
    /// Bitmap of received segments.
    pub block_ack: u32,
}

/// Payload of a completed reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassembledContent {
    /// A segmented access message, still upper-transport encrypted.
    Access {
        /// AID from the segment headers (`None` for device-key traffic).
        aid: Option<u8>,
        /// MIC size flag of the access payload.
        szmic: bool,
        /// Concatenated ciphertext ‖ TransMIC.
        payload: Vec<u8>,
    },
    /// A segmented control message.
    Control {
        /// Control opcode.
        opcode: u8,
        /// Concatenated parameters.
        parameters: Vec<u8>,
    },
}

/// A fully reassembled message ready for the upper transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    /// Source of the message.
    pub src: Address,
    /// Destination of the message.
    pub dst: Address,
    /// TTL of the last received segment.
    pub ttl: u8,
    /// IV-Index the segments were accepted under.
    pub iv_index: u32,
    /// Sequence number of the first segment; the upper-transport nonce
    /// is built from it.
    pub seq: u32,
    /// The reassembled content.
    pub content: ReassembledContent,
}

/// Result of feeding one segment in.
#[derive(Debug, Default)]
pub struct SegmentResult {
    /// An acknowledgement to send now, if any.
    pub ack: Option<SegmentAckAction>,
    /// The completed message, if this segment was the last one.
    pub message: Option<ReassembledMessage>,
}

#[derive(Debug)]
enum EntryKind {
    Access { aid: Option<u8>, szmic: bool },
    Control { opcode: u8 },
}

#[derive(Debug)]
struct ReassemblyEntry {
    kind: EntryKind,
    seg_n: u8,
    block_ack: u32,
    segments: Vec<Option<Vec<u8>>>,
    ttl: u8,
    seq: u32,
    iv_index: u32,
    network_key: KeyIndex,
    ack_timer: Option<TimerHandle>,
    completed: bool,
}

impl ReassemblyEntry {
    fn full_mask(&self) -> u32 {
        if self.seg_n == 31 {
            u32::MAX
        } else {
            (1u32 << (self.seg_n as u32 + 1)) - 1
        }
    }
}

/// Inbound reassembly table.
pub struct InboundSegmentation {
    config: ReassemblyConfig,
    entries: HashMap<SarKey, ReassemblyEntry>,
}

impl InboundSegmentation {
    /// Creates an empty table.
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Feeds in one received segment.
    ///
    /// `carrier_seq` is the network-layer sequence number of the PDU that
    /// carried the segment; the first-segment sequence is reconstructed
    /// from it and SeqZero.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_segment(
        &mut self,
        timers: &dyn TimerService,
        network_key: KeyIndex,
        src: Address,
        dst: Address,
        ttl: u8,
        carrier_seq: u32,
        iv_index: u32,
        pdu: &LowerTransportPdu,
    ) -> SegmentResult {
        let (kind, seq_zero, seg_o, seg_n, segment) = match pdu {
            LowerTransportPdu::SegmentedAccess {
                aid,
                szmic,
                seq_zero,
                seg_o,
                seg_n,
                segment,
            } => (
                EntryKind::Access {
                    aid: *aid,
                    szmic: *szmic,
                },
                *seq_zero,
                *seg_o,
                *seg_n,
                segment,
            ),
            LowerTransportPdu::SegmentedControl {
                opcode,
                seq_zero,
                seg_o,
                seg_n,
                segment,
            } => (
                EntryKind::Control { opcode: *opcode },
                *seq_zero,
                *seg_o,
                *seg_n,
                segment,
            ),
            _ => return SegmentResult::default(),
        };

        let seq = seq_from_seq_zero(carrier_seq, seq_zero);
        let key = SarKey {
            src,
            dst,
            seq_auth: seq_auth(iv_index, seq),
        };
        let ack_allowed = dst.is_unicast();
        let incomplete_timeout = self.config.effective_incomplete_timeout();

        let entry = self.entries.entry(key).or_insert_with(|| {
            trace!(%src, %dst, seq, seg_n, "New reassembly entry");
            // The incomplete timer is the entry's only exit; its handle is
            // not kept because nothing else removes the entry.
            timers.schedule(incomplete_timeout, TimerEvent::InboundIncomplete(key));
            ReassemblyEntry {
                kind,
                seg_n,
                block_ack: 0,
                segments: vec![None; seg_n as usize + 1],
                ttl,
                seq,
                iv_index,
                network_key,
                ack_timer: None,
                completed: false,
            }
        });

        if entry.seg_n != seg_n {
            trace!(%src, seg_n, expected = entry.seg_n, "Segment with inconsistent SegN ignored");
            return SegmentResult::default();
        }

        if entry.completed {
            // The message was already delivered; a late or repeated segment
            // means our ack got lost. Re-ack, deliver nothing.
            let ack = ack_allowed.then(|| SegmentAckAction {
                src: dst,
                dst: src,
                network_key: entry.network_key,
                seq_zero,
                block_ack: entry.block_ack,
            });
            return SegmentResult { ack, message: None };
        }

        let bit = 1u32 << seg_o as u32;
        if entry.block_ack & bit == 0 {
            entry.block_ack |= bit;
            entry.segments[seg_o as usize] = Some(segment.clone());
            entry.ttl = ttl;
        }

        if entry.block_ack == entry.full_mask() {
            if let Some(timer) = entry.ack_timer.take() {
                timers.cancel(timer);
            }
            entry.completed = true;
            debug!(%src, %dst, seq = entry.seq, "Reassembly complete");

            let payload: Vec<u8> = entry
                .segments
                .iter()
                .flat_map(|s| s.as_deref().expect("bitmap full").iter().copied())
                .collect();
            let content = match &entry.kind {
                EntryKind::Access { aid, szmic } => ReassembledContent::Access {
                    aid: *aid,
                    szmic: *szmic,
                    payload,
                },
                EntryKind::Control { opcode } => ReassembledContent::Control {
                    opcode: *opcode,
                    parameters: payload,
                },
            };
            let ack = ack_allowed.then(|| SegmentAckAction {
                src: dst,
                dst: src,
                network_key: entry.network_key,
                seq_zero,
                block_ack: entry.block_ack,
            });
            return SegmentResult {
                ack,
                message: Some(ReassembledMessage {
                    src,
                    dst,
                    ttl: entry.ttl,
                    iv_index: entry.iv_index,
                    seq: entry.seq,
                    content,
                }),
            };
        }

        // Still assembling; make sure an ack timer is pending for unicast
        // destinations.
        if ack_allowed && entry.ack_timer.is_none() {
            entry.ack_timer =
                Some(timers.schedule(inbound_ack_delay(ttl), TimerEvent::InboundAck(key)));
        }
        SegmentResult::default()
    }

    /// The ack timer fired: report what has arrived so far.
    pub fn ack_timer_fired(&mut self, key: SarKey) -> Option<SegmentAckAction> {
        let entry = self.entries.get_mut(&key)?;
        entry.ack_timer = None;
        if entry.completed {
            return None;
        }
        Some(SegmentAckAction {
            src: key.dst,
            dst: key.src,
            network_key: entry.network_key,
            seq_zero: (entry.seq & 0x1FFF) as u16,
            block_ack: entry.block_ack,
        })
    }

    /// The incomplete timer fired: drop the entry without an ack.
    pub fn incomplete_timer_fired(&mut self, timers: &dyn TimerService, key: SarKey) {
        if let Some(entry) = self.entries.remove(&key) {
            if let Some(timer) = entry.ack_timer {
                timers.cancel(timer);
            }
            if !entry.completed {
                debug!(src = %key.src, "Reassembly abandoned, segments missing");
            }
        }
    }

    /// Number of live entries (tombstones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no reassembly is in progress.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outbound SAR tuning.
#[derive(Debug, Clone, Copy)]
pub struct OutboundSarConfig {
    /// Full retransmission rounds after the initial one.
    pub retransmit_count: u8,
}

impl Default for OutboundSarConfig {
    fn default() -> Self {
        Self {
            retransmit_count: 2,
        }
    }
}

/// Everything constant about one outbound segmented message.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMeta {
    /// Handle the application can cancel with.
    pub handle: MessageHandle,
    /// Sending local element.
    pub src: Address,
    /// Destination.
    pub dst: Address,
    /// TTL for every segment.
    pub ttl: u8,
    /// Network key sealing the segments.
    pub network_key: KeyIndex,
    /// AID of the application key, or `None` for device-key traffic.
    pub aid: Option<u8>,
    /// MIC size flag used by the upper transport.
    pub szmic: bool,
    /// SeqZero: low 13 bits of the first segment's sequence number.
    pub seq_zero: u16,
}

/// What a received block-ack did to an outbound message.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// No outbound message matches this ack.
    NotMine,
    /// Empty block-ack: the peer is busy; the message failed without retry.
    Busy(MessageHandle),
    /// Every segment acknowledged.
    Completed(MessageHandle),
    /// Some segments still missing; retransmit exactly these.
    Retransmit(MessageHandle, Vec<LowerTransportPdu>),
}

/// What the retransmission timer did.
#[derive(Debug, PartialEq, Eq)]
pub enum RetransmitOutcome {
    /// No such message (already completed or cancelled).
    Unknown,
    /// Retry budget exhausted; the message failed with a timeout.
    TimedOut(MessageHandle),
    /// Another round: retransmit these segments.
    Retransmit(MessageHandle, Vec<LowerTransportPdu>),
}

#[derive(Debug)]
struct OutboundEntry {
    meta: OutboundMeta,
    segments: Vec<Vec<u8>>,
    unacked: u32,
    retries_left: u8,
    timer: Option<TimerHandle>,
}

impl OutboundEntry {
    fn pdus_for(&self, mask: u32) -> Vec<LowerTransportPdu> {
        let seg_n = (self.segments.len() - 1) as u8;
        self.segments
            .iter()
            .enumerate()
            .filter(|(index, _)| mask & (1 << *index as u32) != 0)
            .map(|(index, segment)| LowerTransportPdu::SegmentedAccess {
                aid: self.meta.aid,
                szmic: self.meta.szmic,
                seq_zero: self.meta.seq_zero,
                seg_o: index as u8,
                seg_n,
                segment: segment.clone(),
            })
            .collect()
    }
}

/// Outbound segmented-message table.
pub struct OutboundSegmentation {
    config: OutboundSarConfig,
    entries: HashMap<MessageHandle, OutboundEntry>,
}

impl OutboundSegmentation {
    /// Creates an empty table.
    pub fn new(config: OutboundSarConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Registers a message and returns every segment for the first
    /// transmission, in ascending SegO order.
    pub fn start(
        &mut self,
        timers: &dyn TimerService,
        meta: OutboundMeta,
        upper_pdu: &[u8],
    ) -> Vec<LowerTransportPdu> {
        let segments: Vec<Vec<u8>> = upper_pdu
            .chunks(ACCESS_SEGMENT_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();
        let seg_count = segments.len() as u32;
        let unacked = if seg_count == 32 {
            u32::MAX
        } else {
            (1u32 << seg_count) - 1
        };

        let mut entry = OutboundEntry {
            meta,
            segments,
            unacked,
            retries_left: self.config.retransmit_count,
            timer: None,
        };
        let pdus = entry.pdus_for(unacked);
        entry.timer = Some(timers.schedule(
            outbound_ack_delay(meta.ttl),
            TimerEvent::OutboundRetransmit(meta.handle),
        ));
        self.entries.insert(meta.handle, entry);
        pdus
    }

    /// Applies a received block-ack from `from`.
    pub fn handle_ack(
        &mut self,
        timers: &dyn TimerService,
        from: Address,
        seq_zero: u16,
        block_ack: u32,
    ) -> AckOutcome {
        let handle = match self
            .entries
            .iter()
            .find(|(_, e)| e.meta.dst == from && e.meta.seq_zero == seq_zero)
        {
            Some((handle, _)) => *handle,
            None => return AckOutcome::NotMine,
        };

        if block_ack == 0 {
            // BusyAck: the peer has no room for this message right now.
            let entry = self.entries.remove(&handle).expect("entry just found");
            if let Some(timer) = entry.timer {
                timers.cancel(timer);
            }
            return AckOutcome::Busy(handle);
        }

        let entry = self.entries.get_mut(&handle).expect("entry just found");
        entry.unacked &= !block_ack;
        if entry.unacked == 0 {
            let entry = self.entries.remove(&handle).expect("entry just found");
            if let Some(timer) = entry.timer {
                timers.cancel(timer);
            }
            return AckOutcome::Completed(handle);
        }

        // Progress: retransmit only what is missing and restart the wait.
        let pdus = entry.pdus_for(entry.unacked);
        if let Some(timer) = entry.timer.take() {
            timers.cancel(timer);
        }
        entry.timer = Some(timers.schedule(
            outbound_ack_delay(entry.meta.ttl),
            TimerEvent::OutboundRetransmit(handle),
        ));
        AckOutcome::Retransmit(handle, pdus)
    }

    /// The acknowledgement timer fired for `handle`.
    pub fn retransmit_timer_fired(
        &mut self,
        timers: &dyn TimerService,
        handle: MessageHandle,
    ) -> RetransmitOutcome {
        let entry = match self.entries.get_mut(&handle) {
            Some(entry) => entry,
            None => return RetransmitOutcome::Unknown,
        };
        entry.timer = None;
        if entry.retries_left == 0 {
            self.entries.remove(&handle);
            return RetransmitOutcome::TimedOut(handle);
        }
        entry.retries_left -= 1;
        let pdus = entry.pdus_for(entry.unacked);
        entry.timer = Some(timers.schedule(
            outbound_ack_delay(entry.meta.ttl),
            TimerEvent::OutboundRetransmit(handle),
        ));
        RetransmitOutcome::Retransmit(handle, pdus)
    }

    /// Cancels an outbound message, clearing its state and timer.
    pub fn cancel(&mut self, timers: &dyn TimerService, handle: MessageHandle) -> bool {
        match self.entries.remove(&handle) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timers.cancel(timer);
                }
                true
            }
            None => false,
        }
    }

    /// True if a segmented message is in flight between this pair.
    pub fn in_flight_between(&self, src: Address, dst: Address) -> bool {
        self.entries
            .values()
            .any(|e| e.meta.src == src && e.meta.dst == dst)
    }
}
