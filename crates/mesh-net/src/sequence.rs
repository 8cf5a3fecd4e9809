//! Sequence number allocation (Mesh Profile §3.8.8).
//!
//! Each local element owns a monotone 24-bit counter per IV-Index. A
//! sequence number is never reused; approaching the end of the space is
//! the signal to request an IV-Update, which resets every counter.

use std::collections::HashMap;

use mesh_core::{Address, SEQUENCE_LIMIT};
use thiserror::Error;

/// The element ran out of 24-bit sequence numbers for this IV-Index.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Sequence space exhausted for element {0}")]
pub struct SequenceExhausted(pub Address);

/// A freshly allocated sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqAllocation {
    /// The sequence number to use.
    pub seq: u32,
    /// True once the counter crossed the IV-Update threshold; the caller
    /// should start (or keep requesting) an IV-Update.
    pub iv_update_needed: bool,
}

/// Per-element sequence allocators.
#[derive(Debug)]
pub struct ElementSequences {
    next: HashMap<Address, u32>,
    threshold: u32,
}

impl ElementSequences {
    /// Creates allocators that flag IV-Update past `threshold`.
    pub fn new(threshold: u32) -> Self {
        Self {
            next: HashMap::new(),
            threshold,
        }
    }

    /// Allocates the next sequence number for `element`.
    pub fn allocate(&mut self, element: Address) -> Result<SeqAllocation, SequenceExhausted> {
        let next = self.next.entry(element).or_insert(0);
        if *next >= SEQUENCE_LIMIT {
            return Err(SequenceExhausted(element));
        }
        let seq = *next;
        *next += 1;
        Ok(SeqAllocation {
            seq,
            iv_update_needed: seq >= self.threshold,
        })
    }

    /// Resets every counter; called when the IV-Index increments.
    pub fn reset(&mut self) {
        self.next.clear();
    }

    /// Restores a persisted counter, e.g. after a restart.
    pub fn restore(&mut self, element: Address, next_seq: u32) {
        self.next.insert(element, next_seq);
    }
}
