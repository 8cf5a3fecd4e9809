//! The mesh configuration database.
//!
//! Holds the durable view of one mesh network, keys, nodes, provisioners
//! and their allocated ranges, and converts it to and from the JSON
//! document shape of the SIG Mesh Configuration Database profile (hex
//! strings for keys and addresses, camelCase member names). The protocol
//! engine never reads the JSON; it is loaded into this model once.

use mesh_core::{
    Address, ApplicationKey, DeviceKey, IvIndex, KeyIndex, NetworkKey, Node, Timestamp,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::ranges::{any_overlap, AddressRange};

/// A provisioner and its allocated ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioner {
    /// Provisioner UUID.
    pub uuid: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Unicast ranges this provisioner assigns from.
    pub unicast_ranges: Vec<AddressRange>,
    /// Group ranges this provisioner assigns from.
    pub group_ranges: Vec<AddressRange>,
}

/// The in-memory network configuration.
#[derive(Debug)]
pub struct MeshNetwork {
    /// Network UUID.
    pub uuid: Uuid,
    /// Network name.
    pub name: String,
    /// Last modification time.
    pub timestamp: Timestamp,
    /// Current IV-Index.
    pub iv_index: IvIndex,
    /// The local provisioner, when known (handed in at init; the engine
    /// does not persist it itself).
    pub local_provisioner: Option<Uuid>,
    network_keys: Vec<NetworkKey>,
    application_keys: Vec<ApplicationKey>,
    provisioners: Vec<Provisioner>,
    nodes: Vec<Node>,
}

impl MeshNetwork {
    /// Creates an empty network.
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            timestamp: Timestamp::now(),
            iv_index: IvIndex::INITIAL,
            local_provisioner: None,
            network_keys: Vec::new(),
            application_keys: Vec::new(),
            provisioners: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// All network keys.
    pub fn network_keys(&self) -> &[NetworkKey] {
        &self.network_keys
    }

    /// All application keys.
    pub fn application_keys(&self) -> &[ApplicationKey] {
        &self.application_keys
    }

    /// All provisioners.
    pub fn provisioners(&self) -> &[Provisioner] {
        &self.provisioners
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Adds a network key under a validated index.
    pub fn add_network_key(&mut self, index: u16, key: [u8; 16]) -> Result<KeyIndex, ConfigError> {
        let index =
            KeyIndex::try_from(index).map_err(|e| ConfigError::KeyIndexOutOfRange(e.0))?;
        self.network_keys.retain(|k| k.index() != index);
        self.network_keys.push(NetworkKey::new(index, key));
        Ok(index)
    }

    /// Adds an application key bound to an existing network key.
    pub fn add_application_key(
        &mut self,
        index: u16,
        key: [u8; 16],
        bound_network_key: u16,
    ) -> Result<KeyIndex, ConfigError> {
        let index =
            KeyIndex::try_from(index).map_err(|e| ConfigError::KeyIndexOutOfRange(e.0))?;
        let bound = KeyIndex::try_from(bound_network_key)
            .map_err(|e| ConfigError::KeyIndexOutOfRange(e.0))?;
        if !self.network_keys.iter().any(|k| k.index() == bound) {
            return Err(ConfigError::KeyIndexOutOfRange(bound_network_key));
        }
        self.application_keys.retain(|k| k.index() != index);
        self.application_keys
            .push(ApplicationKey::new(index, key, bound));
        Ok(index)
    }

    /// Adds a provisioner after checking its ranges against every other
    /// provisioner's.
    pub fn add_provisioner(&mut self, provisioner: Provisioner) -> Result<(), ConfigError> {
        if self.provisioners.iter().any(|p| p.uuid == provisioner.uuid) {
            return Err(ConfigError::ProvisionerUsedInAnotherNetwork);
        }
        for existing in &self.provisioners {
            if any_overlap(&provisioner.unicast_ranges, &existing.unicast_ranges)
                || any_overlap(&provisioner.group_ranges, &existing.group_ranges)
            {
                return Err(ConfigError::OverlappingProvisionerRanges);
            }
        }
        self.provisioners.push(provisioner);
        Ok(())
    }

    /// The lowest unicast span of `element_count` addresses available in
    /// the provisioner's ranges.
    pub fn next_available_unicast(
        &self,
        provisioner: Uuid,
        element_count: u8,
    ) -> Result<Address, ConfigError> {
        let provisioner = self
            .provisioners
            .iter()
            .find(|p| p.uuid == provisioner)
            .ok_or(ConfigError::ProvisionerNotInNetwork)?;

        for range in &provisioner.unicast_ranges {
            let mut candidate = range.low();
            while range.contains_span(candidate, element_count) {
                match self.node_blocking(candidate, element_count) {
                    None => return Ok(candidate),
                    Some(node) => {
                        // Jump past the blocking node and keep scanning.
                        let next = node.last_unicast().0 as u32 + 1;
                        if next > Address::MAX_UNICAST.0 as u32 {
                            break;
                        }
                        candidate = Address(next as u16);
                    }
                }
            }
        }
        Err(ConfigError::NoAddressAvailable(element_count))
    }

    /// Registers a provisioned node.
    pub fn add_node(&mut self, node: Node) -> Result<(), ConfigError> {
        if self.nodes.iter().any(|n| n.uuid == node.uuid) {
            return Err(ConfigError::NodeAlreadyExists);
        }
        if self.node_blocking(node.primary_unicast, node.element_count).is_some() {
            return Err(ConfigError::AddressNotAvailable(node.primary_unicast.0));
        }
        self.nodes.push(node);
        self.timestamp = Timestamp::now();
        Ok(())
    }

    /// A node by element address.
    pub fn node_for_element(&self, address: Address) -> Option<&Node> {
        self.nodes.iter().find(|n| n.contains_element(address))
    }

    fn node_blocking(&self, address: Address, element_count: u8) -> Option<&Node> {
        let first = address.0;
        let last = first + element_count.max(1) as u16 - 1;
        self.nodes.iter().find(|node| {
            let node_first = node.primary_unicast.0;
            let node_last = node.last_unicast().0;
            first <= node_last && node_first <= last
        })
    }

    /// Serializes to the configuration-database JSON document.
    pub fn export(&self) -> Result<String, ConfigError> {
        let document = Document::from_network(self);
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Parses a configuration-database JSON document.
    pub fn import(json: &str, local_provisioner: Option<Uuid>) -> Result<Self, ConfigError> {
        let document: Document = serde_json::from_str(json)?;
        document.into_network(local_provisioner)
    }
}

/// Source of the persisted configuration document.
///
/// The engine treats the document as opaque beyond [`MeshNetwork::import`]
/// and [`MeshNetwork::export`]; hosts wire this to a file, a keychain or a
/// cloud backend.
pub trait ConfigStorage {
    /// Loads the last saved document, or `None` on first run.
    fn load(&mut self) -> Result<Option<String>, ConfigError>;

    /// Persists a document.
    fn save(&mut self, document: &str) -> Result<(), ConfigError>;
}

// ---------------------------------------------------------------------
// JSON document shape
// ---------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    mesh_uuid: Uuid,
    mesh_name: String,
    timestamp: i64,
    iv_index: u32,
    iv_update_active: bool,
    net_keys: Vec<NetKeyEntry>,
    app_keys: Vec<AppKeyEntry>,
    provisioners: Vec<ProvisionerEntry>,
    nodes: Vec<NodeEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetKeyEntry {
    index: u16,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_key: Option<String>,
    phase: u8,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppKeyEntry {
    index: u16,
    bound_net_key: u16,
    key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionerEntry {
    #[serde(rename = "UUID")]
    uuid: Uuid,
    provisioner_name: String,
    allocated_unicast_range: Vec<RangeEntry>,
    allocated_group_range: Vec<RangeEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeEntry {
    low_address: String,
    high_address: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeEntry {
    #[serde(rename = "UUID")]
    uuid: Uuid,
    unicast_address: String,
    device_key: String,
    element_count: u8,
    net_keys: Vec<u16>,
    app_keys: Vec<u16>,
    features: u16,
}

impl Document {
    fn from_network(network: &MeshNetwork) -> Self {
        Self {
            mesh_uuid: network.uuid,
            mesh_name: network.name.clone(),
            timestamp: network.timestamp.as_millis(),
            iv_index: network.iv_index.index,
            iv_update_active: network.iv_index.update_active,
            net_keys: network
                .network_keys
                .iter()
                .map(|key| NetKeyEntry {
                    index: key.index().value(),
                    key: hex::encode(key.key()),
                    old_key: key.old_key().map(hex::encode),
                    phase: match key.phase() {
                        mesh_core::KeyRefreshPhase::NormalOperation => 0,
                        mesh_core::KeyRefreshPhase::DistributingKeys => 1,
                        mesh_core::KeyRefreshPhase::Finalizing => 2,
                    },
                })
                .collect(),
            app_keys: network
                .application_keys
                .iter()
                .map(|key| AppKeyEntry {
                    index: key.index().value(),
                    bound_net_key: key.bound_network_key().value(),
                    key: hex::encode(key.key()),
                })
                .collect(),
            provisioners: network
                .provisioners
                .iter()
                .map(|p| ProvisionerEntry {
                    uuid: p.uuid,
                    provisioner_name: p.name.clone(),
                    allocated_unicast_range: p.unicast_ranges.iter().map(range_entry).collect(),
                    allocated_group_range: p.group_ranges.iter().map(range_entry).collect(),
                })
                .collect(),
            nodes: network
                .nodes
                .iter()
                .map(|node| NodeEntry {
                    uuid: node.uuid,
                    unicast_address: format!("{:04X}", node.primary_unicast.0),
                    device_key: hex::encode(node.device_key.as_bytes()),
                    element_count: node.element_count,
                    net_keys: node.network_keys.iter().map(|k| k.value()).collect(),
                    app_keys: node.application_keys.iter().map(|k| k.value()).collect(),
                    features: node.features.bits(),
                })
                .collect(),
        }
    }

    fn into_network(self, local_provisioner: Option<Uuid>) -> Result<MeshNetwork, ConfigError> {
        let mut network = MeshNetwork::new(self.mesh_uuid, self.mesh_name);
        network.timestamp = Timestamp::new(self.timestamp);
        network.iv_index = IvIndex::new(self.iv_index, self.iv_update_active);
        network.local_provisioner = local_provisioner;

        for entry in self.net_keys {
            let index = network.add_network_key(entry.index, parse_key(&entry.key)?)?;
            // Restore an in-progress refresh: install the new key over the
            // old one so the transmit-key rule comes out right.
            if let Some(old_key) = entry.old_key {
                let old_key = parse_key(&old_key)?;
                let key = network
                    .network_keys
                    .iter_mut()
                    .find(|k| k.index() == index)
                    .expect("just added");
                let new_key = *key.key();
                *key = NetworkKey::new(index, old_key);
                key.update_key(new_key, network.timestamp);
                if entry.phase >= 2 {
                    key.finalize_refresh(network.timestamp);
                }
            }
        }
        for entry in self.app_keys {
            network.add_application_key(entry.index, parse_key(&entry.key)?, entry.bound_net_key)?;
        }
        for entry in self.provisioners {
            let provisioner = Provisioner {
                uuid: entry.uuid,
                name: entry.provisioner_name,
                unicast_ranges: entry
                    .allocated_unicast_range
                    .iter()
                    .map(|r| parse_range(r, AddressRange::unicast))
                    .collect::<Result<_, _>>()?,
                group_ranges: entry
                    .allocated_group_range
                    .iter()
                    .map(|r| parse_range(r, AddressRange::group))
                    .collect::<Result<_, _>>()?,
            };
            network.add_provisioner(provisioner)?;
        }
        for entry in self.nodes {
            let unicast = parse_address(&entry.unicast_address)?;
            let device_key = DeviceKey(parse_key(&entry.device_key)?);
            let first_net_key = entry
                .net_keys
                .first()
                .copied()
                .map(KeyIndex::try_from)
                .transpose()
                .map_err(|e| ConfigError::KeyIndexOutOfRange(e.0))?
                .unwrap_or(KeyIndex::PRIMARY);
            let mut node = Node::new(
                entry.uuid,
                unicast,
                entry.element_count,
                device_key,
                first_net_key,
            );
            node.features = mesh_core::Features(entry.features);
            for index in entry.net_keys.into_iter().skip(1) {
                node.network_keys.push(
                    KeyIndex::try_from(index).map_err(|e| ConfigError::KeyIndexOutOfRange(e.0))?,
                );
            }
            for index in entry.app_keys {
                node.application_keys.push(
                    KeyIndex::try_from(index).map_err(|e| ConfigError::KeyIndexOutOfRange(e.0))?,
                );
            }
            network.add_node(node)?;
        }
        Ok(network)
    }
}

fn range_entry(range: &AddressRange) -> RangeEntry {
    RangeEntry {
        low_address: format!("{:04X}", range.low().0),
        high_address: format!("{:04X}", range.high().0),
    }
}

fn parse_range(
    entry: &RangeEntry,
    build: impl Fn(Address, Address) -> Result<AddressRange, ConfigError>,
) -> Result<AddressRange, ConfigError> {
    build(
        parse_address(&entry.low_address)?,
        parse_address(&entry.high_address)?,
    )
}

fn parse_address(hex_address: &str) -> Result<Address, ConfigError> {
    let bytes = hex::decode(hex_address)?;
    let bytes: [u8; 2] = bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidDocument("address must be 4 hex digits".into()))?;
    Ok(Address::from_be_bytes(bytes))
}

fn parse_key(hex_key: &str) -> Result<[u8; 16], ConfigError> {
    hex::decode(hex_key)?
        .try_into()
        .map_err(|_| ConfigError::InvalidDocument("key must be 32 hex digits".into()))
}
