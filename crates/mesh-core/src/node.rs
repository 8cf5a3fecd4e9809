//! Nodes, elements and the feature bitmap.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::keys::{DeviceKey, KeyIndex};

/// Node feature bitmap: relay, proxy, friend, low power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(pub u16);

impl Features {
    /// No features.
    pub const NONE: Features = Features(0);
    /// Relay feature.
    pub const RELAY: Features = Features(0x0001);
    /// GATT proxy feature.
    pub const PROXY: Features = Features(0x0002);
    /// Friend feature.
    pub const FRIEND: Features = Features(0x0004);
    /// Low-power feature.
    pub const LOW_POWER: Features = Features(0x0008);

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(&self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    /// Wire representation for the heartbeat features field.
    pub const fn bits(&self) -> u16 {
        self.0
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Features) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Features::RELAY) {
            names.push("relay");
        }
        if self.contains(Features::PROXY) {
            names.push("proxy");
        }
        if self.contains(Features::FRIEND) {
            names.push("friend");
        }
        if self.contains(Features::LOW_POWER) {
            names.push("low-power");
        }
        write!(f, "[{}]", names.join(", "))
    }
}

/// A provisioned node as known to this provisioner.
///
/// Nodes are arena-owned by the network model and referenced by UUID or
/// unicast address; they hold no pointers back into the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Device UUID from the unprovisioned beacon.
    pub uuid: Uuid,
    /// Unicast address of the primary element.
    pub primary_unicast: Address,
    /// Number of elements, occupying a contiguous address span.
    pub element_count: u8,
    /// Device key agreed during provisioning.
    pub device_key: DeviceKey,
    /// Network keys known to the node.
    pub network_keys: Vec<KeyIndex>,
    /// Application keys known to the node.
    pub application_keys: Vec<KeyIndex>,
    /// Advertised features.
    pub features: Features,
    /// Replay-protection list capacity hint from composition data.
    pub replay_capacity: Option<u16>,
    /// Raw composition data page 0, once read.
    pub composition_data: Option<Vec<u8>>,
}

impl Node {
    /// Creates a freshly provisioned node.
    pub fn new(
        uuid: Uuid,
        primary_unicast: Address,
        element_count: u8,
        device_key: DeviceKey,
        network_key: KeyIndex,
    ) -> Self {
        Self {
            uuid,
            primary_unicast,
            element_count,
            device_key,
            network_keys: vec![network_key],
            application_keys: Vec::new(),
            features: Features::NONE,
            replay_capacity: None,
            composition_data: None,
        }
    }

    /// The last unicast address occupied by this node's elements.
    pub fn last_unicast(&self) -> Address {
        Address(self.primary_unicast.0 + self.element_count.max(1) as u16 - 1)
    }

    /// True if `address` belongs to one of this node's elements.
    pub fn contains_element(&self, address: Address) -> bool {
        address >= self.primary_unicast && address <= self.last_unicast()
    }
}
