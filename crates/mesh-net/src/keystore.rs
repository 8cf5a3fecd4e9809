//! The live key store, owned by the manager.
//!
//! Holds the network and application keys of the mesh, the provisioned
//! nodes (for device keys and element spans) and the local node's address
//! range. Mutations go through methods that keep derived material
//! consistent; the layers only ever see finished keys.

use mesh_core::{Address, ApplicationKey, DeviceKey, KeyIndex, NetworkKey, Node};

/// The local node: the provisioner's own addresses and device key.
#[derive(Debug, Clone)]
pub struct LocalNode {
    /// Unicast address of the primary element.
    pub primary_unicast: Address,
    /// Number of local elements.
    pub element_count: u8,
    /// The local device key, when the provisioner provisioned itself.
    pub device_key: Option<DeviceKey>,
}

impl LocalNode {
    /// True if `address` is one of the local elements.
    pub fn contains_element(&self, address: Address) -> bool {
        let last = self.primary_unicast.0 + self.element_count.max(1) as u16 - 1;
        address.0 >= self.primary_unicast.0 && address.0 <= last
    }

    /// The unicast address of element `index`.
    pub fn element_address(&self, index: u8) -> Option<Address> {
        (index < self.element_count.max(1)).then(|| Address(self.primary_unicast.0 + index as u16))
    }
}

/// Keys and nodes known to this manager.
#[derive(Debug)]
pub struct KeyStore {
    network_keys: Vec<NetworkKey>,
    application_keys: Vec<ApplicationKey>,
    nodes: Vec<Node>,
    local: LocalNode,
}

impl KeyStore {
    /// Creates a store for the local node.
    pub fn new(local: LocalNode) -> Self {
        Self {
            network_keys: Vec::new(),
            application_keys: Vec::new(),
            nodes: Vec::new(),
            local,
        }
    }

    /// The local node.
    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    /// Installs the local node's own device key (set after the provisioner
    /// provisions itself, or restored from configuration).
    pub fn set_local_device_key(&mut self, key: DeviceKey) {
        self.local.device_key = Some(key);
    }

    /// Adds or replaces a network key.
    pub fn add_network_key(&mut self, key: NetworkKey) {
        self.network_keys.retain(|k| k.index() != key.index());
        self.network_keys.push(key);
    }

    /// Adds or replaces an application key.
    pub fn add_application_key(&mut self, key: ApplicationKey) {
        self.application_keys.retain(|k| k.index() != key.index());
        self.application_keys.push(key);
    }

    /// All network keys.
    pub fn network_keys(&self) -> &[NetworkKey] {
        &self.network_keys
    }

    /// A network key by index.
    pub fn network_key(&self, index: KeyIndex) -> Option<&NetworkKey> {
        self.network_keys.iter().find(|k| k.index() == index)
    }

    /// Mutable access to a network key, for refresh transitions.
    pub fn network_key_mut(&mut self, index: KeyIndex) -> Option<&mut NetworkKey> {
        self.network_keys.iter_mut().find(|k| k.index() == index)
    }

    /// An application key by index.
    pub fn application_key(&self, index: KeyIndex) -> Option<&ApplicationKey> {
        self.application_keys.iter().find(|k| k.index() == index)
    }

    /// Application keys bound to `network_key` whose current or old AID is
    /// `aid`, for inbound key trials.
    pub fn application_keys_for_aid(
        &self,
        network_key: KeyIndex,
        aid: u8,
    ) -> impl Iterator<Item = &ApplicationKey> {
        self.application_keys
            .iter()
            .filter(move |k| k.bound_network_key() == network_key)
            .filter(move |k| k.keys_matching_aid(aid).next().is_some())
    }

    /// Registers a provisioned node.
    pub fn add_node(&mut self, node: Node) {
        self.nodes.retain(|n| n.uuid != node.uuid);
        self.nodes.push(node);
    }

    /// All known nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The node owning the element at `address`.
    pub fn node_for_element(&self, address: Address) -> Option<&Node> {
        self.nodes.iter().find(|n| n.contains_element(address))
    }

    /// The device key for traffic from or to the element at `address`.
    ///
    /// Looks through provisioned nodes first, then the local node.
    pub fn device_key_for(&self, address: Address) -> Option<&DeviceKey> {
        if let Some(node) = self.node_for_element(address) {
            return Some(&node.device_key);
        }
        if self.local.contains_element(address) {
            return self.local.device_key.as_ref();
        }
        None
    }
}
