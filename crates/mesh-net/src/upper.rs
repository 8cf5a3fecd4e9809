//! Upper-transport key selection (Mesh Profile §3.6.3).
//!
//! On receive the AID narrows the candidate application keys (old refresh
//! keys included); device-key traffic is tried with the source node's
//! device key, plus the local key when the message targets one of this
//! node's own elements. Virtual destinations multiply the candidates by
//! every subscribed label that hashes to the destination address.

use mesh_core::{Address, DeviceKey, KeyIndex, MeshAddress};
use mesh_proto::upper::{open_access_payload, AccessKey};
use tracing::trace;
use uuid::Uuid;

use crate::keystore::KeyStore;

/// Which key set sealed a message; responses are sent with the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySet {
    /// An application key, by index.
    Application(KeyIndex),
    /// The device key of the relevant node.
    Device,
}

/// A decrypted access message with its resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedAccess {
    /// The decrypted access payload.
    pub payload: Vec<u8>,
    /// The key set that authenticated it.
    pub key_set: KeySet,
    /// Destination with the matching label attached when virtual.
    pub dst: MeshAddress,
}

/// Context of one inbound upper-transport PDU.
#[derive(Debug, Clone, Copy)]
pub struct InboundContext {
    /// Network key that carried the PDU.
    pub network_key: KeyIndex,
    /// Source element.
    pub src: Address,
    /// Destination address as received.
    pub dst: Address,
    /// Sequence number for the nonce (first segment for segmented).
    pub seq: u32,
    /// IV-Index the PDU was accepted under.
    pub iv_index: u32,
    /// MIC size flag.
    pub szmic: bool,
    /// AID from the lower-transport header, `None` for device-key traffic.
    pub aid: Option<u8>,
}

/// Tries every eligible key until one authenticates the payload.
///
/// `subscribed_labels` are the label UUIDs of local subscriptions whose
/// virtual address equals `ctx.dst`; empty for non-virtual destinations.
pub fn open_inbound(
    keys: &KeyStore,
    ctx: &InboundContext,
    subscribed_labels: &[Uuid],
    data: &[u8],
) -> Option<DecryptedAccess> {
    let label_candidates: Vec<Option<Uuid>> = if ctx.dst.is_virtual() {
        subscribed_labels.iter().copied().map(Some).collect()
    } else {
        vec![None]
    };

    match ctx.aid {
        Some(aid) => {
            for app_key in keys.application_keys_for_aid(ctx.network_key, aid) {
                for key_bytes in app_key.keys_matching_aid(aid) {
                    for label in &label_candidates {
                        if let Ok(payload) = open_access_payload(
                            AccessKey::Application(key_bytes),
                            ctx.szmic,
                            ctx.seq,
                            ctx.src,
                            ctx.dst,
                            label.as_ref(),
                            ctx.iv_index,
                            data,
                        ) {
                            return Some(DecryptedAccess {
                                payload,
                                key_set: KeySet::Application(app_key.index()),
                                dst: resolve_dst(ctx.dst, *label),
                            });
                        }
                    }
                }
            }
            trace!(aid, src = %ctx.src, "No application key authenticated the payload");
            None
        }
        None => {
            // The source node's key covers status traffic arriving at a
            // provisioner; the local key covers configuration traffic
            // arriving at this node's own elements.
            let mut candidates: Vec<&DeviceKey> = Vec::with_capacity(2);
            if let Some(key) = keys.device_key_for(ctx.src) {
                candidates.push(key);
            }
            if keys.local().contains_element(ctx.dst) {
                if let Some(key) = keys.local().device_key.as_ref() {
                    if !candidates.contains(&key) {
                        candidates.push(key);
                    }
                }
            }
            for device_key in candidates {
                for label in &label_candidates {
                    if let Ok(payload) = open_access_payload(
                        AccessKey::Device(device_key.as_bytes()),
                        ctx.szmic,
                        ctx.seq,
                        ctx.src,
                        ctx.dst,
                        label.as_ref(),
                        ctx.iv_index,
                        data,
                    ) {
                        return Some(DecryptedAccess {
                            payload,
                            key_set: KeySet::Device,
                            dst: resolve_dst(ctx.dst, *label),
                        });
                    }
                }
            }
            trace!(src = %ctx.src, "No device key authenticated the payload");
            None
        }
    }
}

/// Resolves the key material for an outbound message.
///
/// Returns the key bytes, the AID to put in the lower-transport header and
/// the network key index to seal with.
pub fn select_outbound_key<'a>(
    keys: &'a KeyStore,
    key_set: KeySet,
    dst: Address,
) -> Option<(AccessKey<'a>, Option<u8>, KeyIndex)> {
    match key_set {
        KeySet::Application(index) => {
            let app_key = keys.application_key(index)?;
            let net_index = app_key.bound_network_key();
            let phase = keys.network_key(net_index)?.phase();
            let (key_bytes, aid) = app_key.transmit_key(phase);
            Some((AccessKey::Application(key_bytes), Some(aid), net_index))
        }
        KeySet::Device => {
            let device_key: &DeviceKey = keys.device_key_for(dst)?;
            // Device-key traffic rides the primary network key.
            let net_index = keys
                .node_for_element(dst)
                .and_then(|node| node.network_keys.first().copied())
                .unwrap_or(KeyIndex::PRIMARY);
            Some((AccessKey::Device(device_key.as_bytes()), None, net_index))
        }
    }
}

fn resolve_dst(dst: Address, label: Option<Uuid>) -> MeshAddress {
    match label {
        Some(label) => {
            MeshAddress::try_with_label(dst, label).unwrap_or_else(|| MeshAddress::new(dst))
        }
        None => MeshAddress::new(dst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::LocalNode;
    use mesh_core::{virtual_address, ApplicationKey, NetworkKey, Node};
    use mesh_proto::upper::seal_access_payload;

    fn store_with_app_key() -> KeyStore {
        let mut store = KeyStore::new(LocalNode {
            primary_unicast: Address(0x0001),
            element_count: 1,
            device_key: None,
        });
        store.add_network_key(NetworkKey::new(KeyIndex::PRIMARY, [0x10; 16]));
        store.add_application_key(ApplicationKey::new(
            KeyIndex::PRIMARY,
            [0x20; 16],
            KeyIndex::PRIMARY,
        ));
        store
    }

    fn ctx(aid: Option<u8>, dst: Address) -> InboundContext {
        InboundContext {
            network_key: KeyIndex::PRIMARY,
            src: Address(0x0042),
            dst,
            seq: 5,
            iv_index: 0,
            szmic: false,
            aid,
        }
    }

    #[test]
    fn test_application_key_roundtrip() {
        let store = store_with_app_key();
        let app_key = store.application_key(KeyIndex::PRIMARY).unwrap();
        let aid = app_key.aid();

        let dst = MeshAddress::new(Address(0x0001));
        let sealed = seal_access_payload(
            AccessKey::Application(app_key.key()),
            false,
            5,
            Address(0x0042),
            &dst,
            0,
            b"on",
        )
        .unwrap();

        let opened = open_inbound(&store, &ctx(Some(aid), dst.address()), &[], &sealed)
            .expect("authenticates");
        assert_eq!(opened.payload, b"on");
        assert_eq!(opened.key_set, KeySet::Application(KeyIndex::PRIMARY));
    }

    #[test]
    fn test_wrong_aid_drops() {
        let store = store_with_app_key();
        let app_key = store.application_key(KeyIndex::PRIMARY).unwrap();
        let dst = MeshAddress::new(Address(0x0001));
        let sealed = seal_access_payload(
            AccessKey::Application(app_key.key()),
            false,
            5,
            Address(0x0042),
            &dst,
            0,
            b"on",
        )
        .unwrap();

        let wrong_aid = (app_key.aid() + 1) & 0x3F;
        assert!(open_inbound(&store, &ctx(Some(wrong_aid), dst.address()), &[], &sealed).is_none());
    }

    #[test]
    fn test_device_key_by_source_node() {
        let mut store = store_with_app_key();
        store.add_node(Node::new(
            Uuid::new_v4(),
            Address(0x0042),
            1,
            DeviceKey([0x77; 16]),
            KeyIndex::PRIMARY,
        ));

        let dst = MeshAddress::new(Address(0x0001));
        let sealed = seal_access_payload(
            AccessKey::Device(&[0x77; 16]),
            false,
            5,
            Address(0x0042),
            &dst,
            0,
            b"status",
        )
        .unwrap();

        let opened = open_inbound(&store, &ctx(None, dst.address()), &[], &sealed)
            .expect("device key authenticates");
        assert_eq!(opened.key_set, KeySet::Device);

        // Traffic from an unknown node has no device key to try.
        let unknown = InboundContext {
            src: Address(0x0099),
            ..ctx(None, dst.address())
        };
        assert!(open_inbound(&store, &unknown, &[], &sealed).is_none());
    }

    #[test]
    fn test_virtual_label_resolution() {
        let store = store_with_app_key();
        let app_key = store.application_key(KeyIndex::PRIMARY).unwrap();
        let aid = app_key.aid();

        let label = Uuid::from_bytes([0x5B; 16]);
        let dst = MeshAddress::with_label(label);
        let sealed = seal_access_payload(
            AccessKey::Application(app_key.key()),
            false,
            9,
            Address(0x0042),
            &dst,
            0,
            b"lvl",
        )
        .unwrap();

        // Without the subscribed label, nothing opens.
        assert!(open_inbound(&store, &ctx(Some(aid), dst.address()), &[], &sealed).is_none());

        // The right label opens and is attached to the destination. A
        // decoy label hashing elsewhere is skipped harmlessly.
        let decoy = Uuid::from_bytes([0x11; 16]);
        let mut ctx9 = ctx(Some(aid), dst.address());
        ctx9.seq = 9;
        let opened =
            open_inbound(&store, &ctx9, &[decoy, label], &sealed).expect("label authenticates");
        assert_eq!(opened.dst.label(), Some(&label));
        assert_eq!(virtual_address(&label), opened.dst.address());
    }

    #[test]
    fn test_select_outbound_device_key() {
        let mut store = store_with_app_key();
        store.add_node(Node::new(
            Uuid::new_v4(),
            Address(0x0042),
            1,
            DeviceKey([0x77; 16]),
            KeyIndex::PRIMARY,
        ));

        let (key, aid, net) =
            select_outbound_key(&store, KeySet::Device, Address(0x0042)).expect("resolves");
        assert!(matches!(key, AccessKey::Device(_)));
        assert_eq!(aid, None);
        assert_eq!(net, KeyIndex::PRIMARY);

        assert!(select_outbound_key(&store, KeySet::Device, Address(0x0999)).is_none());
    }

    #[test]
    fn test_select_outbound_app_key() {
        let store = store_with_app_key();
        let (_, aid, net) =
            select_outbound_key(&store, KeySet::Application(KeyIndex::PRIMARY), Address(0x0042))
                .expect("resolves");
        assert_eq!(
            aid,
            Some(store.application_key(KeyIndex::PRIMARY).unwrap().aid())
        );
        assert_eq!(net, KeyIndex::PRIMARY);
    }
}
