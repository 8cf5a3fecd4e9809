//! The stateful network layer: candidate-key trial, replay admission and
//! sequence allocation around the `mesh-proto` network codec.

use mesh_core::{Address, IvIndex, KeyIndex, NetworkKey};
use mesh_proto::network::{NetworkNonce, NetworkPdu};
use tracing::trace;

use crate::replay::ReplayCache;
use crate::sequence::{ElementSequences, SeqAllocation, SequenceExhausted};

/// A network PDU that passed decryption, replay and IVI checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNetworkPdu {
    /// The decrypted PDU.
    pub pdu: NetworkPdu,
    /// Index of the network key that authenticated it.
    pub network_key: KeyIndex,
    /// The full IV-Index it was accepted under.
    pub iv_index: u32,
}

/// Network-layer state: the replay cache and per-element counters.
#[derive(Debug)]
pub struct NetworkLayer {
    replay: ReplayCache,
    sequences: ElementSequences,
}

impl NetworkLayer {
    /// Creates the layer with the given IV-Update request threshold.
    pub fn new(seq_threshold: u32) -> Self {
        Self {
            replay: ReplayCache::new(),
            sequences: ElementSequences::new(seq_threshold),
        }
    }

    /// Allocates the next sequence number for a local element.
    pub fn next_seq(&mut self, element: Address) -> Result<SeqAllocation, SequenceExhausted> {
        self.sequences.allocate(element)
    }

    /// Resets sequence counters after an IV-Index increment.
    pub fn on_iv_index_changed(&mut self) {
        self.sequences.reset();
    }

    /// Restores a persisted sequence counter at startup.
    pub fn restore_sequence(&mut self, element: Address, next_seq: u32) {
        self.sequences.restore(element, next_seq);
    }

    /// Opens a received network PDU against every candidate key.
    ///
    /// Tries each network key whose current or old NID matches, under the
    /// IV-Index resolved from the IVI bit. Anything that fails (unknown
    /// NID, MIC mismatch, replay) is a silent drop reported as `None`.
    pub fn open_incoming(
        &mut self,
        keys: &[NetworkKey],
        iv: IvIndex,
        data: &[u8],
        nonce: NetworkNonce,
    ) -> Option<InboundNetworkPdu> {
        let first = *data.first()?;
        let nid = first & 0x7F;
        let iv_index = match iv.index_for_ivi(first >> 7) {
            Some(index) => index,
            None => {
                trace!(ivi = first >> 7, "IVI bit does not match the current IV-Index");
                return None;
            }
        };

        for key in keys {
            for derived in key.receive_keys().filter(|d| d.nid == nid) {
                match NetworkPdu::open(data, derived, iv_index, nonce) {
                    Ok(pdu) => {
                        if !self.replay.check_and_record(pdu.src, pdu.seq, iv_index) {
                            trace!(src = %pdu.src, seq = pdu.seq, "Replayed PDU discarded");
                            return None;
                        }
                        return Some(InboundNetworkPdu {
                            pdu,
                            network_key: key.index(),
                            iv_index,
                        });
                    }
                    // Wrong candidate or garbage; try the next key.
                    Err(_) => continue,
                }
            }
        }
        trace!(nid, "No network key opened the PDU");
        None
    }
}
