//! The IV-Index pair and its monotone state ordering (Mesh Profile §3.10.5).
//!
//! The pair `(index, update_active)` walks the sequence
//! `(X, false) → (X+1, true) → (X+1, false) → (X+2, true) → …`; each state
//! must persist at least 96 hours and the update-active states at most 144.
//! The dwell accounting itself lives with the beacon handler; this type
//! carries the ordering and the transmit/accept index rules.

use serde::{Deserialize, Serialize};

/// The 32-bit IV-Index with its update flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IvIndex {
    /// The announced IV-Index value.
    pub index: u32,
    /// True while an IV-Update procedure is in progress.
    pub update_active: bool,
}

impl IvIndex {
    /// The initial state of a new network.
    pub const INITIAL: IvIndex = IvIndex {
        index: 0,
        update_active: false,
    };

    /// Creates a state pair.
    pub const fn new(index: u32, update_active: bool) -> Self {
        Self {
            index,
            update_active,
        }
    }

    /// Position of this pair in the monotone transition sequence.
    ///
    /// `(X, false)` maps to `2X`, `(X, true)` to `2X - 1`, so later states
    /// always compare greater and the step count between two states is the
    /// difference of their values.
    pub const fn transition_state(&self) -> u64 {
        // (0, true) is not a reachable state but must not underflow when a
        // forged beacon announces it.
        (2 * self.index as u64).saturating_sub(self.update_active as u64)
    }

    /// The index used for outbound PDUs.
    ///
    /// While an update is in progress the node keeps transmitting with the
    /// previous index so that slower nodes still authenticate its traffic.
    pub const fn transmit_index(&self) -> u32 {
        if self.update_active {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// Resolves the IVI bit of a received network PDU to a full index.
    ///
    /// In normal operation only the current index is acceptable and a
    /// mismatched IVI bit rejects the PDU. During an update both the
    /// current and previous indices are in the air, distinguished by their
    /// low bit.
    pub fn index_for_ivi(&self, ivi: u8) -> Option<u32> {
        let ivi = ivi & 1;
        if self.index & 1 == ivi as u32 {
            return Some(self.index);
        }
        if self.update_active && self.index > 0 {
            return Some(self.index - 1);
        }
        None
    }

    /// Number of transition steps from `self` to `other`; `None` when
    /// `other` is not strictly later.
    pub fn steps_to(&self, other: &IvIndex) -> Option<u64> {
        other
            .transition_state()
            .checked_sub(self.transition_state())
            .filter(|&d| d > 0)
    }
}
