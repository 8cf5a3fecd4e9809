//! Allocated address ranges of a provisioner.
//!
//! Each provisioner owns disjoint unicast and group ranges; addresses are
//! only ever assigned from the owner's ranges, which keeps concurrent
//! provisioners from handing out colliding addresses.

use mesh_core::Address;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An inclusive address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    low: Address,
    high: Address,
}

impl AddressRange {
    /// Creates a range; `low` must not exceed `high`.
    pub fn new(low: Address, high: Address) -> Result<Self, ConfigError> {
        if low > high || low.is_unassigned() {
            return Err(ConfigError::InvalidRange);
        }
        Ok(Self { low, high })
    }

    /// Creates a unicast range; both bounds must be unicast addresses.
    pub fn unicast(low: Address, high: Address) -> Result<Self, ConfigError> {
        if !low.is_unicast() || !high.is_unicast() {
            return Err(ConfigError::InvalidRange);
        }
        Self::new(low, high)
    }

    /// Creates a group range; both bounds must be group addresses below
    /// the fixed-group block.
    pub fn group(low: Address, high: Address) -> Result<Self, ConfigError> {
        if !low.is_group() || !high.is_group() || low.is_fixed_group() || high.is_fixed_group() {
            return Err(ConfigError::InvalidRange);
        }
        Self::new(low, high)
    }

    /// Lower bound.
    pub const fn low(&self) -> Address {
        self.low
    }

    /// Upper bound.
    pub const fn high(&self) -> Address {
        self.high
    }

    /// True if `address` lies in the range.
    pub fn contains(&self, address: Address) -> bool {
        address >= self.low && address <= self.high
    }

    /// True if the whole `count`-element span starting at `address` lies
    /// in the range.
    pub fn contains_span(&self, address: Address, count: u8) -> bool {
        let last = address.0 as u32 + count.max(1) as u32 - 1;
        self.contains(address) && last <= self.high.0 as u32
    }

    /// True if the two ranges share any address.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

/// True if any range in `a` overlaps any range in `b`.
pub fn any_overlap(a: &[AddressRange], b: &[AddressRange]) -> bool {
    a.iter().any(|ra| b.iter().any(|rb| ra.overlaps(rb)))
}
