//! Two-node test harness over an in-memory bearer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use mesh_core::{Address, ApplicationKey, IvIndex, KeyIndex, MeshAddress, NetworkKey};
use mesh_net::access::MessageHandle;
use mesh_net::bearer::{Bearer, BearerError, PduType};
use mesh_net::beacon::IvState;
use mesh_net::keystore::LocalNode;
use mesh_net::manager::{ManagerConfig, ManagerDelegate, MeshManager};
use mesh_net::provisioning::{ProvisioningError, ProvisioningResult};
use mesh_net::timers::ManualTimers;
use mesh_net::upper::KeySet;
use mesh_net::SendError;
use mesh_proto::access::AccessPdu;
use mesh_proto::beacon::UnprovisionedBeacon;
use mesh_proto::lower::Heartbeat;
use mesh_proto::proxy::ProxyConfiguration;

/// Everything the delegate observed, for assertions.
#[derive(Debug, Clone)]
pub enum DelegateEvent {
    /// An access message was received.
    Received {
        /// The message.
        message: AccessPdu,
        /// Its source.
        src: Address,
        /// Its destination address.
        dst: Address,
        /// The key set that authenticated it.
        key_set: KeySet,
    },
    /// A send completed.
    Delivered(MessageHandle),
    /// A send failed.
    Failed(MessageHandle, SendError),
    /// A heartbeat arrived.
    Heartbeat(Heartbeat, Address, u8),
    /// An unprovisioned beacon was observed.
    Unprovisioned(UnprovisionedBeacon),
    /// A proxy configuration message arrived.
    Proxy(ProxyConfiguration, Address),
    /// The IV-Index changed.
    IvChanged(IvIndex),
    /// Provisioning completed.
    ProvisioningComplete(ProvisioningResult),
    /// Provisioning failed.
    ProvisioningFailed(ProvisioningError),
}

type Outbox = Arc<Mutex<VecDeque<(Vec<u8>, PduType)>>>;

struct LoopbackBearer {
    outbox: Outbox,
}

impl Bearer for LoopbackBearer {
    fn send(&mut self, pdu: &[u8], pdu_type: PduType) -> Result<(), BearerError> {
        self.outbox.lock().push_back((pdu.to_vec(), pdu_type));
        Ok(())
    }
}

struct RecordingDelegate {
    events: Arc<Mutex<Vec<DelegateEvent>>>,
}

impl ManagerDelegate for RecordingDelegate {
    fn on_message_received(
        &mut self,
        message: &AccessPdu,
        src: Address,
        dst: &MeshAddress,
        key_set: KeySet,
    ) {
        self.events.lock().push(DelegateEvent::Received {
            message: message.clone(),
            src,
            dst: dst.address(),
            key_set,
        });
    }

    fn on_message_delivered(&mut self, handle: MessageHandle) {
        self.events.lock().push(DelegateEvent::Delivered(handle));
    }

    fn on_message_failed(&mut self, handle: MessageHandle, error: SendError) {
        self.events.lock().push(DelegateEvent::Failed(handle, error));
    }

    fn on_heartbeat(&mut self, heartbeat: &Heartbeat, src: Address, hops: u8) {
        self.events
            .lock()
            .push(DelegateEvent::Heartbeat(*heartbeat, src, hops));
    }

    fn on_unprovisioned_beacon(&mut self, beacon: &UnprovisionedBeacon) {
        self.events
            .lock()
            .push(DelegateEvent::Unprovisioned(beacon.clone()));
    }

    fn on_proxy_configuration(&mut self, message: &ProxyConfiguration, src: Address) {
        self.events
            .lock()
            .push(DelegateEvent::Proxy(message.clone(), src));
    }

    fn on_iv_index_changed(&mut self, iv: IvIndex) {
        self.events.lock().push(DelegateEvent::IvChanged(iv));
    }

    fn on_provisioning_complete(&mut self, result: &ProvisioningResult) {
        self.events
            .lock()
            .push(DelegateEvent::ProvisioningComplete(result.clone()));
    }

    fn on_provisioning_failed(&mut self, error: &ProvisioningError) {
        self.events
            .lock()
            .push(DelegateEvent::ProvisioningFailed(error.clone()));
    }
}

/// A manager under test with its bearer outbox, events and timers.
pub struct TestNode {
    /// The engine.
    pub manager: MeshManager,
    /// Frames the manager handed to the bearer.
    pub outbox: Outbox,
    /// Observed delegate events.
    pub events: Arc<Mutex<Vec<DelegateEvent>>>,
    /// Deterministic timer service shared with the manager.
    pub timers: Arc<ManualTimers>,
}

impl TestNode {
    /// Creates a node with the default configuration.
    pub fn new(unicast: u16, element_count: u8) -> Self {
        Self::with_config(unicast, element_count, ManagerConfig::default())
    }

    /// Creates a node with a custom configuration.
    pub fn with_config(unicast: u16, element_count: u8, config: ManagerConfig) -> Self {
        let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let timers = ManualTimers::new();
        let manager = MeshManager::new(
            config,
            LocalNode {
                primary_unicast: Address(unicast),
                element_count,
                device_key: None,
            },
            IvState::new(IvIndex::INITIAL),
            Box::new(LoopbackBearer {
                outbox: outbox.clone(),
            }),
            timers.clone(),
            Box::new(RecordingDelegate {
                events: events.clone(),
            }),
        );
        Self {
            manager,
            outbox,
            events,
            timers,
        }
    }

    /// Installs the shared test network and application keys.
    pub fn install_test_keys(&mut self) {
        let network_key: [u8; 16] = hex_key("7dd7364cd842ad18c17c2b820c84c3d6");
        self.manager
            .keys_mut()
            .add_network_key(NetworkKey::new(KeyIndex::PRIMARY, network_key));
        self.manager.keys_mut().add_application_key(ApplicationKey::new(
            KeyIndex::PRIMARY,
            hex_key("63964771734fbd76e3b40519d1d94a48"),
            KeyIndex::PRIMARY,
        ));
    }

    /// Takes everything the bearer transmitted so far.
    pub fn drain(&mut self) -> Vec<(Vec<u8>, PduType)> {
        self.outbox.lock().drain(..).collect()
    }

    /// A snapshot of the delegate events.
    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().clone()
    }

    /// Clears recorded events.
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Fires every pending timer whose event matches, one at a time.
    pub fn fire_timers(&mut self, matching: impl Fn(&mesh_net::TimerEvent) -> bool) -> usize {
        let mut fired = 0;
        while let Some(event) = self.timers.pop_matching(&matching) {
            self.manager.handle_timer(event);
            fired += 1;
        }
        fired
    }
}

/// Parses a 32-digit hex key.
pub fn hex_key(hex: &str) -> [u8; 16] {
    let mut key = [0u8; 16];
    for (index, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16).expect("hex digits");
    }
    key
}

/// Pumps frames between two nodes until both outboxes stay empty.
///
/// Returns the total number of frames moved.
pub fn exchange(a: &mut TestNode, b: &mut TestNode) -> usize {
    let mut moved = 0;
    loop {
        let from_a = a.drain();
        let from_b = b.drain();
        if from_a.is_empty() && from_b.is_empty() {
            return moved;
        }
        moved += from_a.len() + from_b.len();
        for (pdu, pdu_type) in from_a {
            b.manager.handle_pdu(&pdu, pdu_type);
        }
        for (pdu, pdu_type) in from_b {
            a.manager.handle_pdu(&pdu, pdu_type);
        }
    }
}
