//! The full two-party provisioning handshake over the loopback bearer.

use mesh_core::{Address, KeyIndex};
use mesh_net::bearer::PduType;
use mesh_net::provisioning::{ProvisioningAuth, ProvisioningConfig, ProvisioningError};
use mesh_proto::beacon::UnprovisionedBeacon;
use mesh_proto::provisioning::ProvisioningPdu;
use mesh_tests::{DelegateEvent, DeviceSimulator, TestNode};
use uuid::Uuid;

const NET_KEY: [u8; 16] = [0x45; 16];
const ASSIGNED_UNICAST: u16 = 0x0B0C;

fn provisioning_config(device_uuid: Uuid, auth: ProvisioningAuth) -> ProvisioningConfig {
    ProvisioningConfig {
        device_uuid,
        network_key: NET_KEY,
        key_index: KeyIndex::PRIMARY,
        flags: 0x00,
        iv_index: 0x12345678,
        unicast_address: Address(ASSIGNED_UNICAST),
        attention: 5,
        auth,
    }
}

/// Shuttles provisioning PDUs between the manager and the simulator until
/// neither side produces more.
fn run_handshake(provisioner: &mut TestNode, device: &mut DeviceSimulator) {
    loop {
        let frames = provisioner.drain();
        if frames.is_empty() {
            return;
        }
        for (frame, pdu_type) in frames {
            assert_eq!(pdu_type, PduType::ProvisioningPdu);
            let pdu = ProvisioningPdu::decode(&frame).expect("well-formed provisioner PDU");
            for response in device.handle(&pdu) {
                provisioner
                    .manager
                    .handle_pdu(&response.encode(), PduType::ProvisioningPdu);
            }
        }
    }
}

#[test]
fn test_handshake_agrees_on_credentials() {
    let mut provisioner = TestNode::new(0x0001, 1);
    let device_uuid = Uuid::from_bytes([0x70; 16]);
    let mut device = DeviceSimulator::with_elements(device_uuid, 3);

    provisioner
        .manager
        .start_provisioning(provisioning_config(device_uuid, ProvisioningAuth::NoOob))
        .unwrap();
    run_handshake(&mut provisioner, &mut device);

    // The provisioner reported completion with the agreed device key.
    let result = provisioner
        .events()
        .iter()
        .find_map(|e| match e {
            DelegateEvent::ProvisioningComplete(result) => Some(result.clone()),
            _ => None,
        })
        .expect("provisioning completed");
    assert_eq!(result.unicast_address, Address(ASSIGNED_UNICAST));
    assert_eq!(result.element_count, 3);
    assert_eq!(result.device_uuid, device_uuid);

    // Both sides derived the same device key, bit for bit.
    assert_eq!(device.device_key, Some(*result.device_key.as_bytes()));

    // The provisioning data decrypted at the peer to the expected values.
    let data = device.received_data.expect("data received");
    assert_eq!(data.network_key, NET_KEY);
    assert_eq!(data.key_index, 0);
    assert_eq!(data.flags, 0x00);
    assert_eq!(data.iv_index, 0x12345678);
    assert_eq!(data.unicast_address, ASSIGNED_UNICAST);

    // The new node landed in the key store with its element span.
    let node = provisioner
        .manager
        .keys()
        .node_for_element(Address(ASSIGNED_UNICAST + 2))
        .expect("node registered");
    assert_eq!(node.uuid, device_uuid);
    assert_eq!(node.element_count, 3);
}

#[test]
fn test_static_oob_handshake() {
    let mut provisioner = TestNode::new(0x0001, 1);
    let device_uuid = Uuid::from_bytes([0x71; 16]);
    let mut device = DeviceSimulator::new(device_uuid);
    device.enable_static_oob([0x3A; 16]);

    provisioner
        .manager
        .start_provisioning(provisioning_config(
            device_uuid,
            ProvisioningAuth::StaticOob([0x3A; 16]),
        ))
        .unwrap();
    run_handshake(&mut provisioner, &mut device);

    assert!(provisioner
        .events()
        .iter()
        .any(|e| matches!(e, DelegateEvent::ProvisioningComplete(_))));
}

#[test]
fn test_confirmation_mismatch_aborts() {
    let mut provisioner = TestNode::new(0x0001, 1);
    let device_uuid = Uuid::from_bytes([0x72; 16]);
    let mut device = DeviceSimulator::new(device_uuid);
    device.corrupt_auth_value();

    provisioner
        .manager
        .start_provisioning(provisioning_config(device_uuid, ProvisioningAuth::NoOob))
        .unwrap();
    run_handshake(&mut provisioner, &mut device);

    let failures: Vec<_> = provisioner
        .events()
        .iter()
        .filter_map(|e| match e {
            DelegateEvent::ProvisioningFailed(error) => Some(error.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![ProvisioningError::ConfirmationFailed]);
    assert!(provisioner.manager.keys().nodes().is_empty());
}

#[test]
fn test_link_timeout_aborts_once() {
    let mut provisioner = TestNode::new(0x0001, 1);
    let device_uuid = Uuid::from_bytes([0x73; 16]);
    provisioner
        .manager
        .start_provisioning(provisioning_config(device_uuid, ProvisioningAuth::NoOob))
        .unwrap();
    provisioner.drain();

    // The device never answers the invite.
    let fired = provisioner.fire_timers(|e| matches!(e, mesh_net::TimerEvent::ProvisioningTimeout));
    assert_eq!(fired, 1);
    let failures = provisioner
        .events()
        .iter()
        .filter(|e| matches!(e, DelegateEvent::ProvisioningFailed(ProvisioningError::Timeout)))
        .count();
    assert_eq!(failures, 1);

    // A second session can start afterwards.
    provisioner
        .manager
        .start_provisioning(provisioning_config(device_uuid, ProvisioningAuth::NoOob))
        .unwrap();
}

#[test]
fn test_concurrent_session_refused() {
    let mut provisioner = TestNode::new(0x0001, 1);
    let uuid = Uuid::from_bytes([0x74; 16]);
    provisioner
        .manager
        .start_provisioning(provisioning_config(uuid, ProvisioningAuth::NoOob))
        .unwrap();
    assert!(provisioner
        .manager
        .start_provisioning(provisioning_config(uuid, ProvisioningAuth::NoOob))
        .is_err());
}

#[test]
fn test_unprovisioned_beacon_surfaces() {
    let mut provisioner = TestNode::new(0x0001, 1);
    let beacon = UnprovisionedBeacon {
        device_uuid: Uuid::from_bytes([0x75; 16]),
        oob_information: 0x0020,
        uri_hash: None,
    };
    provisioner
        .manager
        .handle_pdu(&beacon.encode(), PduType::MeshBeacon);

    assert!(provisioner.events().iter().any(|e| matches!(
        e,
        DelegateEvent::Unprovisioned(b) if b.device_uuid == beacon.device_uuid
    )));
}
