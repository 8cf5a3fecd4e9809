//! Mesh addresses (Mesh Profile §3.4.2).
//!
//! The 16-bit address space splits into:
//! - `0x0000` - unassigned
//! - `0x0001..=0x7FFF` - unicast (one element)
//! - `0x8000..=0xBFFF` - virtual (hash of a 128-bit label UUID)
//! - `0xC000..=0xFEFF` - group
//! - `0xFF00..=0xFFFF` - fixed groups, including all-nodes `0xFFFF`

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{aes_cmac, s1};

/// A 16-bit mesh address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u16);

impl Address {
    /// The unassigned address.
    pub const UNASSIGNED: Address = Address(0x0000);
    /// Fixed group: all proxy nodes.
    pub const ALL_PROXIES: Address = Address(0xFFFC);
    /// Fixed group: all friend nodes.
    pub const ALL_FRIENDS: Address = Address(0xFFFD);
    /// Fixed group: all relay nodes.
    pub const ALL_RELAYS: Address = Address(0xFFFE);
    /// Fixed group: every node in the network.
    pub const ALL_NODES: Address = Address(0xFFFF);

    /// Highest assignable unicast address.
    pub const MAX_UNICAST: Address = Address(0x7FFF);

    /// Returns true for `0x0000`.
    pub const fn is_unassigned(&self) -> bool {
        self.0 == 0x0000
    }

    /// Returns true for `0x0001..=0x7FFF`.
    pub const fn is_unicast(&self) -> bool {
        self.0 != 0x0000 && self.0 & 0x8000 == 0
    }

    /// Returns true for `0x8000..=0xBFFF`.
    pub const fn is_virtual(&self) -> bool {
        self.0 & 0xC000 == 0x8000
    }

    /// Returns true for `0xC000..=0xFFFF`, fixed groups included.
    pub const fn is_group(&self) -> bool {
        self.0 & 0xC000 == 0xC000
    }

    /// Returns true for the fixed-group range `0xFF00..=0xFFFF`.
    pub const fn is_fixed_group(&self) -> bool {
        self.0 >= 0xFF00
    }

    /// Returns true if the address may appear as a message destination.
    pub const fn is_valid_destination(&self) -> bool {
        !self.is_unassigned()
    }

    /// Big-endian wire representation.
    pub const fn to_be_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Parses the big-endian wire representation.
    pub const fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{:04X})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Address> for u16 {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Hashes a label UUID into its virtual address.
///
/// ```text
/// vtad = s1("vtad")
/// addr = (AES-CMAC(vtad, label)[14..16] | 0x8000) & 0xBFFF
/// ```
///
/// The result always lands in the virtual range `0x8000..=0xBFFF`.
pub fn virtual_address(label: &Uuid) -> Address {
    let salt = s1(b"vtad");
    let hash = aes_cmac(&salt, label.as_bytes());
    let raw = u16::from_be_bytes([hash[14], hash[15]]);
    Address((raw | 0x8000) & 0xBFFF)
}

/// A destination address, with the label UUID attached when virtual.
///
/// The constructor enforces `address == virtual_address(label)` whenever a
/// label is present, so a `MeshAddress` never carries a mismatched pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAddress {
    address: Address,
    label: Option<Uuid>,
}

impl MeshAddress {
    /// Wraps a plain (non-virtual) address.
    pub const fn new(address: Address) -> Self {
        Self {
            address,
            label: None,
        }
    }

    /// Builds the virtual address for a label UUID.
    pub fn with_label(label: Uuid) -> Self {
        Self {
            address: virtual_address(&label),
            label: Some(label),
        }
    }

    /// Reassociates a received virtual address with a known label.
    ///
    /// Returns `None` when the label does not hash to `address`.
    pub fn try_with_label(address: Address, label: Uuid) -> Option<Self> {
        if virtual_address(&label) == address {
            Some(Self {
                address,
                label: Some(label),
            })
        } else {
            None
        }
    }

    /// The 16-bit address.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// The label UUID, when this is a virtual destination.
    pub const fn label(&self) -> Option<&Uuid> {
        self.label.as_ref()
    }
}

impl From<Address> for MeshAddress {
    fn from(address: Address) -> Self {
        Self::new(address)
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", self.address, label),
            None => write!(f, "{}", self.address),
        }
    }
}
