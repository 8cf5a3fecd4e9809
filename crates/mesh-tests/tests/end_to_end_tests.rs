//! End-to-end access-message scenarios between two managers.

use std::sync::mpsc;

use mesh_core::{Address, DeviceKey, KeyIndex, MeshAddress, Node};
use mesh_net::access::{MessageKind, ModelDelegate};
use mesh_net::bearer::PduType;
use mesh_net::manager::SendOptions;
use mesh_net::upper::KeySet;
use mesh_net::SendError;
use mesh_proto::access::{AccessPdu, Opcode};
use mesh_proto::lower::Heartbeat;
use mesh_proto::network::{NetworkNonce, NetworkPdu};
use mesh_proto::proxy::{FilterType, ProxyConfiguration};
use mesh_tests::{exchange, DelegateEvent, TestNode};
use uuid::Uuid;

const A_ADDR: u16 = 0x0001;
const B_ADDR: u16 = 0x0100;
const ONOFF_GET: Opcode = Opcode::Double(0x8201);
const ONOFF_SET_UNACK: Opcode = Opcode::Double(0x8203);
const ONOFF_STATUS: Opcode = Opcode::Double(0x8204);
const APP: KeySet = KeySet::Application(KeyIndex::PRIMARY);

/// A server answering GET with STATUS and recording what it saw.
struct Server {
    log: mpsc::Sender<String>,
}

impl ModelDelegate for Server {
    fn message_types(&self) -> Vec<(Opcode, MessageKind)> {
        vec![
            (ONOFF_GET, MessageKind::Acknowledged),
            (ONOFF_SET_UNACK, MessageKind::Unacknowledged),
        ]
    }

    fn on_acknowledged(&mut self, _request: &AccessPdu, src: Address, _dst: &MeshAddress) -> AccessPdu {
        self.log.send(format!("get from {src}")).unwrap();
        AccessPdu::new(ONOFF_STATUS, vec![0x01])
    }

    fn on_unacknowledged(&mut self, message: &AccessPdu, _src: Address, dst: &MeshAddress) {
        self.log
            .send(format!("set {:?} at {}", message.parameters, dst.address()))
            .unwrap();
    }

    fn on_response(&mut self, _response: &AccessPdu, _request: &AccessPdu, _src: Address) {
        unreachable!("server never sends requests");
    }
}

/// A client parsing STATUS responses.
struct Client {
    log: mpsc::Sender<String>,
}

impl ModelDelegate for Client {
    fn message_types(&self) -> Vec<(Opcode, MessageKind)> {
        vec![(ONOFF_STATUS, MessageKind::Response)]
    }

    fn on_acknowledged(&mut self, _request: &AccessPdu, _src: Address, _dst: &MeshAddress) -> AccessPdu {
        unreachable!("client answers nothing");
    }

    fn on_unacknowledged(&mut self, _message: &AccessPdu, _src: Address, _dst: &MeshAddress) {}

    fn on_response(&mut self, response: &AccessPdu, request: &AccessPdu, src: Address) {
        self.log
            .send(format!(
                "status {:?} for {} from {src}",
                response.parameters, request.opcode
            ))
            .unwrap();
    }
}

fn pair() -> (TestNode, TestNode) {
    let mut a = TestNode::new(A_ADDR, 1);
    let mut b = TestNode::new(B_ADDR, 1);
    a.install_test_keys();
    b.install_test_keys();
    (a, b)
}

#[test]
fn test_unacknowledged_delivery() {
    let (mut a, mut b) = pair();
    let (tx, rx) = mpsc::channel();
    b.manager
        .register_model(0, 0x1000, Vec::new(), Box::new(Server { log: tx }))
        .unwrap();

    let handle = a
        .manager
        .send(
            AccessPdu::new(ONOFF_SET_UNACK, vec![0x01, 0x02]),
            0,
            MeshAddress::new(Address(B_ADDR)),
            APP,
            SendOptions::default(),
        )
        .unwrap();
    exchange(&mut a, &mut b);

    assert!(a
        .events()
        .iter()
        .any(|e| matches!(e, DelegateEvent::Delivered(h) if *h == handle)));
    assert!(b.events().iter().any(|e| matches!(
        e,
        DelegateEvent::Received { message, src, .. }
            if message.opcode == ONOFF_SET_UNACK && src.0 == A_ADDR
    )));
    assert_eq!(rx.try_recv().unwrap(), "set [1, 2] at 0x0100");
}

#[test]
fn test_acknowledged_request_response() {
    let (mut a, mut b) = pair();
    let (server_tx, server_rx) = mpsc::channel();
    let (client_tx, client_rx) = mpsc::channel();
    b.manager
        .register_model(0, 0x1000, Vec::new(), Box::new(Server { log: server_tx }))
        .unwrap();
    a.manager
        .register_model(0, 0x1001, Vec::new(), Box::new(Client { log: client_tx }))
        .unwrap();

    let handle = a
        .manager
        .send(
            AccessPdu::new(ONOFF_GET, vec![]),
            0,
            MeshAddress::new(Address(B_ADDR)),
            APP,
            SendOptions {
                acknowledged: true,
                ..Default::default()
            },
        )
        .unwrap();
    exchange(&mut a, &mut b);

    assert_eq!(server_rx.try_recv().unwrap(), "get from 0x0001");
    assert_eq!(
        client_rx.try_recv().unwrap(),
        format!("status [1] for {ONOFF_GET} from 0x0100")
    );
    assert!(a
        .events()
        .iter()
        .any(|e| matches!(e, DelegateEvent::Delivered(h) if *h == handle)));

    // The response arrived, so the response timer must not fire a timeout.
    a.fire_timers(|e| matches!(e, mesh_net::TimerEvent::ResponseTimeout(_)));
    assert!(!a
        .events()
        .iter()
        .any(|e| matches!(e, DelegateEvent::Failed(..))));
}

#[test]
fn test_acknowledged_timeout_without_peer() {
    let (mut a, _b) = pair();
    let handle = a
        .manager
        .send(
            AccessPdu::new(ONOFF_GET, vec![]),
            0,
            MeshAddress::new(Address(B_ADDR)),
            APP,
            SendOptions {
                acknowledged: true,
                ..Default::default()
            },
        )
        .unwrap();
    // Nobody answers; the frame evaporates.
    a.drain();

    let fired = a.fire_timers(|e| matches!(e, mesh_net::TimerEvent::ResponseTimeout(_)));
    assert_eq!(fired, 1);
    assert!(a
        .events()
        .iter()
        .any(|e| matches!(e, DelegateEvent::Failed(h, SendError::Timeout) if *h == handle)));
}

#[test]
fn test_group_subscription() {
    let (mut a, mut b) = pair();
    let group = MeshAddress::new(Address(0xC010));
    let (tx, rx) = mpsc::channel();
    b.manager
        .register_model(0, 0x1000, vec![group], Box::new(Server { log: tx }))
        .unwrap();

    a.manager
        .send(
            AccessPdu::new(ONOFF_SET_UNACK, vec![0x05]),
            0,
            group,
            APP,
            SendOptions::default(),
        )
        .unwrap();
    exchange(&mut a, &mut b);

    assert_eq!(rx.try_recv().unwrap(), "set [5] at 0xC010");
}

#[test]
fn test_virtual_address_delivery() {
    let (mut a, mut b) = pair();
    let label = Uuid::from_bytes([0x2F; 16]);
    let destination = MeshAddress::with_label(label);
    let (tx, rx) = mpsc::channel();
    b.manager
        .register_model(0, 0x1000, vec![destination], Box::new(Server { log: tx }))
        .unwrap();

    a.manager
        .send(
            AccessPdu::new(ONOFF_SET_UNACK, vec![0x07]),
            0,
            destination,
            APP,
            SendOptions::default(),
        )
        .unwrap();
    exchange(&mut a, &mut b);

    assert_eq!(
        rx.try_recv().unwrap(),
        format!("set [7] at {}", destination.address())
    );
}

#[test]
fn test_device_key_traffic() {
    let (mut a, mut b) = pair();
    let device_key = DeviceKey([0x5A; 16]);
    // The provisioner knows B's device key; B knows its own.
    a.manager.keys_mut().add_node(Node::new(
        Uuid::from_bytes([0xB0; 16]),
        Address(B_ADDR),
        1,
        device_key,
        KeyIndex::PRIMARY,
    ));
    b.manager.keys_mut().set_local_device_key(device_key);

    let (tx, rx) = mpsc::channel();
    b.manager
        .register_model(0, 0x1000, Vec::new(), Box::new(Server { log: tx }))
        .unwrap();

    a.manager
        .send(
            AccessPdu::new(ONOFF_SET_UNACK, vec![0x0A]),
            0,
            MeshAddress::new(Address(B_ADDR)),
            KeySet::Device,
            SendOptions::default(),
        )
        .unwrap();
    exchange(&mut a, &mut b);

    assert_eq!(rx.try_recv().unwrap(), "set [10] at 0x0100");
    assert!(b.events().iter().any(|e| matches!(
        e,
        DelegateEvent::Received { key_set: KeySet::Device, .. }
    )));
}

#[test]
fn test_replayed_pdu_dropped() {
    let (mut a, mut b) = pair();
    a.manager
        .send(
            AccessPdu::new(ONOFF_SET_UNACK, vec![0x01]),
            0,
            MeshAddress::new(Address(B_ADDR)),
            APP,
            SendOptions::default(),
        )
        .unwrap();
    let frames = a.drain();
    assert_eq!(frames.len(), 1);

    b.manager.handle_pdu(&frames[0].0, frames[0].1);
    b.manager.handle_pdu(&frames[0].0, frames[0].1);

    let received = b
        .events()
        .iter()
        .filter(|e| matches!(e, DelegateEvent::Received { .. }))
        .count();
    assert_eq!(received, 1);
}

#[test]
fn test_cancel_queued_message() {
    let (mut a, mut b) = pair();
    // First message occupies the destination; the second stays queued.
    let first = a
        .manager
        .send(
            AccessPdu::new(ONOFF_GET, vec![]),
            0,
            MeshAddress::new(Address(B_ADDR)),
            APP,
            SendOptions {
                acknowledged: true,
                ..Default::default()
            },
        )
        .unwrap();
    let second = a
        .manager
        .send(
            AccessPdu::new(ONOFF_GET, vec![0x01]),
            0,
            MeshAddress::new(Address(B_ADDR)),
            APP,
            SendOptions::default(),
        )
        .unwrap();
    assert_ne!(first, second);

    // Unsegmented messages transmit immediately, so the first is already
    // out and waiting for its response; cancelling it ends that wait.
    a.manager.cancel(first);
    assert!(a
        .events()
        .iter()
        .any(|e| matches!(e, DelegateEvent::Failed(h, SendError::Cancelled) if *h == first)));

    exchange(&mut a, &mut b);
}

#[test]
fn test_heartbeat_reception() {
    let (mut a, _b) = pair();
    let heartbeat = Heartbeat {
        init_ttl: 3,
        features: mesh_core::Features::RELAY,
    };
    let transport = mesh_proto::lower::LowerTransportPdu::UnsegmentedControl {
        opcode: mesh_proto::lower::OPCODE_HEARTBEAT,
        parameters: heartbeat.encode().to_vec(),
    }
    .encode()
    .unwrap();
    let key = mesh_core::NetworkKey::new(
        KeyIndex::PRIMARY,
        mesh_tests::harness::hex_key("7dd7364cd842ad18c17c2b820c84c3d6"),
    );
    let sealed = NetworkPdu {
        ctl: true,
        ttl: 2,
        seq: 1,
        src: Address(B_ADDR),
        dst: Address(A_ADDR),
        transport_pdu: transport,
    }
    .seal(key.derived(), 0, NetworkNonce::Network)
    .unwrap();

    a.manager.handle_pdu(&sealed, PduType::NetworkPdu);
    assert!(a.events().iter().any(|e| matches!(
        e,
        DelegateEvent::Heartbeat(hb, src, hops)
            if hb.init_ttl == 3 && src.0 == B_ADDR && *hops == 2
    )));
}

#[test]
fn test_proxy_configuration_roundtrip() {
    let (mut a, mut b) = pair();
    a.manager
        .send_proxy_configuration(
            &ProxyConfiguration::SetFilterType(FilterType::Reject),
            KeyIndex::PRIMARY,
        )
        .unwrap();
    exchange(&mut a, &mut b);

    assert!(b.events().iter().any(|e| matches!(
        e,
        DelegateEvent::Proxy(ProxyConfiguration::SetFilterType(FilterType::Reject), src)
            if src.0 == A_ADDR
    )));
}
