//! The access layer: model registry, dispatch, outbound queue and
//! response correlation (Mesh Profile §3.7).
//!
//! Models register an opcode map and three callbacks; inbound messages are
//! routed by destination (element address, subscription, or all-nodes) and
//! opcode. Outbound messages queue per destination with one transmission
//! in flight at a time; acknowledged messages additionally wait for their
//! response under a timer.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use mesh_core::{Address, MeshAddress};
use mesh_proto::access::{AccessPdu, Opcode};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::timers::{TimerEvent, TimerHandle, TimerService};
use crate::upper::KeySet;

/// Handle to a queued or in-flight message, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(pub u64);

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a model classifies an opcode it declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A request that obliges the model to produce a response.
    Acknowledged,
    /// A message consumed without reply.
    Unacknowledged,
    /// A response to an earlier request from this node.
    Response,
}

/// The capability set a host registers per model.
pub trait ModelDelegate: Send {
    /// The opcodes this model understands, with their kinds.
    fn message_types(&self) -> Vec<(Opcode, MessageKind)>;

    /// Whether the model may be subscribed to group/virtual addresses.
    fn is_subscription_supported(&self) -> bool {
        true
    }

    /// An acknowledged request arrived; the returned message is sent back
    /// to `src` with the key set of the request.
    fn on_acknowledged(&mut self, request: &AccessPdu, src: Address, dst: &MeshAddress)
        -> AccessPdu;

    /// An unacknowledged message (or an unsolicited status) arrived.
    fn on_unacknowledged(&mut self, message: &AccessPdu, src: Address, dst: &MeshAddress);

    /// The response to `request`, previously sent by this node, arrived.
    fn on_response(&mut self, response: &AccessPdu, request: &AccessPdu, src: Address);
}

struct RegisteredModel {
    model_id: u32,
    subscriptions: Vec<MeshAddress>,
    opcode_map: HashMap<Opcode, MessageKind>,
    delegate: Box<dyn ModelDelegate>,
}

impl RegisteredModel {
    fn subscribed_to(&self, dst: Address) -> bool {
        self.subscriptions.iter().any(|s| s.address() == dst)
    }
}

struct Element {
    address: Address,
    models: Vec<RegisteredModel>,
}

/// Errors from registry mutation.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Element index outside the local element span
    #[error("No local element with index {0}")]
    NoSuchElement(u8),

    /// A model with this identifier already exists on the element
    #[error("Model 0x{0:08X} already registered on this element")]
    DuplicateModel(u32),

    /// No model with this identifier on the element
    #[error("No model 0x{0:08X} on this element")]
    NoSuchModel(u32),

    /// Group/virtual subscription on a model that does not support it
    #[error("Model does not support subscriptions")]
    SubscriptionUnsupported,
}

/// A message ready for (or awaiting) transmission.
#[derive(Clone)]
pub struct OutgoingMessage {
    /// The cancellation handle.
    pub handle: MessageHandle,
    /// The access PDU to send.
    pub pdu: AccessPdu,
    /// Sending local element.
    pub src: Address,
    /// Destination.
    pub dst: MeshAddress,
    /// Key set to seal with.
    pub key_set: KeySet,
    /// TTL override; the manager default applies when `None`.
    pub ttl: Option<u8>,
    /// True when a response is expected and a timeout should run.
    pub acknowledged: bool,
}

struct PendingResponse {
    handle: MessageHandle,
    peer: Address,
    local: Address,
    key_set: KeySet,
    request: AccessPdu,
    model: Option<(usize, usize)>,
    timer: TimerHandle,
}

/// What cancellation found.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Nothing known under this handle.
    NotFound,
    /// Removed from the queue before any transmission.
    Dequeued,
    /// The message is mid-transmission; the caller must clear its SAR
    /// state and advance the queue for this destination.
    InFlight(Address),
    /// The message was sent and was awaiting its response.
    AwaitingResponse,
}

/// A reply produced by an acknowledged handler, not yet queued.
#[derive(Clone)]
pub struct ResponseMessage {
    /// The response PDU.
    pub pdu: AccessPdu,
    /// The responding local element.
    pub src: Address,
    /// The requester.
    pub dst: MeshAddress,
    /// Key set of the request, echoed back.
    pub key_set: KeySet,
}

/// Responses produced by a dispatch, to be enqueued by the manager.
#[derive(Default)]
pub struct DispatchResult {
    /// Replies from acknowledged handlers.
    pub responses: Vec<ResponseMessage>,
    /// True when some model consumed the message.
    pub handled: bool,
}

/// Access layer configuration.
#[derive(Debug, Clone, Copy)]
pub struct AccessConfig {
    /// Time to wait for the response to an acknowledged message, counted
    /// from the end of transmission. Clamped to at least 30 seconds.
    pub response_timeout: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl AccessConfig {
    fn effective_response_timeout(&self) -> Duration {
        self.response_timeout.max(Duration::from_secs(30))
    }
}

/// The access layer state.
pub struct AccessLayer {
    config: AccessConfig,
    elements: Vec<Element>,
    queues: HashMap<Address, VecDeque<OutgoingMessage>>,
    in_flight: HashMap<Address, OutgoingMessage>,
    pending_responses: Vec<PendingResponse>,
    next_handle: u64,
}

impl AccessLayer {
    /// Creates the layer with elements at the given unicast addresses.
    pub fn new(config: AccessConfig, element_addresses: &[Address]) -> Self {
        Self {
            config,
            elements: element_addresses
                .iter()
                .map(|&address| Element {
                    address,
                    models: Vec::new(),
                })
                .collect(),
            queues: HashMap::new(),
            in_flight: HashMap::new(),
            pending_responses: Vec::new(),
            next_handle: 0,
        }
    }

    /// Registers a model on a local element.
    pub fn register_model(
        &mut self,
        element_index: u8,
        model_id: u32,
        subscriptions: Vec<MeshAddress>,
        delegate: Box<dyn ModelDelegate>,
    ) -> Result<(), RegistryError> {
        let element = self
            .elements
            .get_mut(element_index as usize)
            .ok_or(RegistryError::NoSuchElement(element_index))?;
        if element.models.iter().any(|m| m.model_id == model_id) {
            return Err(RegistryError::DuplicateModel(model_id));
        }
        if !subscriptions.is_empty() && !delegate.is_subscription_supported() {
            return Err(RegistryError::SubscriptionUnsupported);
        }
        let opcode_map = delegate.message_types().into_iter().collect();
        element.models.push(RegisteredModel {
            model_id,
            subscriptions,
            opcode_map,
            delegate,
        });
        Ok(())
    }

    /// Adds a subscription to a registered model.
    pub fn subscribe(
        &mut self,
        element_index: u8,
        model_id: u32,
        address: MeshAddress,
    ) -> Result<(), RegistryError> {
        let element = self
            .elements
            .get_mut(element_index as usize)
            .ok_or(RegistryError::NoSuchElement(element_index))?;
        let model = element
            .models
            .iter_mut()
            .find(|m| m.model_id == model_id)
            .ok_or(RegistryError::NoSuchModel(model_id))?;
        if !model.delegate.is_subscription_supported() {
            return Err(RegistryError::SubscriptionUnsupported);
        }
        if !model.subscriptions.contains(&address) {
            model.subscriptions.push(address);
        }
        Ok(())
    }

    /// Label UUIDs of local subscriptions that hash to `dst`.
    pub fn subscribed_labels(&self, dst: Address) -> Vec<Uuid> {
        let mut labels = Vec::new();
        for element in &self.elements {
            for model in &element.models {
                for subscription in &model.subscriptions {
                    if subscription.address() == dst {
                        if let Some(label) = subscription.label() {
                            if !labels.contains(label) {
                                labels.push(*label);
                            }
                        }
                    }
                }
            }
        }
        labels
    }

    /// Queues a message. Returns its handle and, when the destination was
    /// idle, the message to transmit right away.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &mut self,
        pdu: AccessPdu,
        src: Address,
        dst: MeshAddress,
        key_set: KeySet,
        ttl: Option<u8>,
        acknowledged: bool,
    ) -> (MessageHandle, Option<OutgoingMessage>) {
        self.next_handle += 1;
        let handle = MessageHandle(self.next_handle);
        let message = OutgoingMessage {
            handle,
            pdu,
            src,
            dst,
            key_set,
            ttl,
            acknowledged,
        };

        let destination = dst.address();
        if self.in_flight.contains_key(&destination) {
            trace!(%handle, %destination, "Destination busy, message queued");
            self.queues.entry(destination).or_default().push_back(message);
            (handle, None)
        } else {
            self.in_flight.insert(destination, message.clone());
            (handle, Some(message))
        }
    }

    /// Marks the in-flight transmission for `dst` finished and pops the
    /// next queued message, making it in-flight.
    pub fn transmit_complete(&mut self, dst: Address) -> Option<OutgoingMessage> {
        self.in_flight.remove(&dst);
        let queue = self.queues.get_mut(&dst)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&dst);
        }
        if let Some(message) = &next {
            self.in_flight.insert(dst, message.clone());
        }
        next
    }

    /// The in-flight message for `dst`, if any.
    pub fn in_flight(&self, dst: Address) -> Option<&OutgoingMessage> {
        self.in_flight.get(&dst)
    }

    /// The in-flight message with the given handle, if any.
    pub fn in_flight_by_handle(&self, handle: MessageHandle) -> Option<&OutgoingMessage> {
        self.in_flight.values().find(|m| m.handle == handle)
    }

    /// Starts the response timer for a transmitted acknowledged message.
    ///
    /// For segmented messages this is called once the last segment went
    /// out (on final block-ack), not at first transmission.
    pub fn await_response(&mut self, timers: &dyn TimerService, message: &OutgoingMessage) {
        let model = self.find_requesting_model(message.src, &message.pdu.opcode);
        let timer = timers.schedule(
            self.config.effective_response_timeout(),
            TimerEvent::ResponseTimeout(message.handle),
        );
        self.pending_responses.push(PendingResponse {
            handle: message.handle,
            peer: message.dst.address(),
            local: message.src,
            key_set: message.key_set,
            request: message.pdu.clone(),
            model,
            timer,
        });
    }

    /// The response timer fired. Returns true when a request was still
    /// outstanding (the caller reports a timeout failure).
    pub fn response_timeout(&mut self, handle: MessageHandle) -> bool {
        let before = self.pending_responses.len();
        self.pending_responses.retain(|p| p.handle != handle);
        before != self.pending_responses.len()
    }

    /// Cancels a message wherever it currently is.
    pub fn cancel(&mut self, timers: &dyn TimerService, handle: MessageHandle) -> CancelOutcome {
        for queue in self.queues.values_mut() {
            if let Some(index) = queue.iter().position(|m| m.handle == handle) {
                queue.remove(index);
                return CancelOutcome::Dequeued;
            }
        }
        if let Some((&dst, _)) = self.in_flight.iter().find(|(_, m)| m.handle == handle) {
            self.in_flight.remove(&dst);
            return CancelOutcome::InFlight(dst);
        }
        if let Some(index) = self.pending_responses.iter().position(|p| p.handle == handle) {
            let pending = self.pending_responses.remove(index);
            timers.cancel(pending.timer);
            return CancelOutcome::AwaitingResponse;
        }
        CancelOutcome::NotFound
    }

    /// Routes an inbound access message.
    ///
    /// Correlated responses complete their pending request; everything
    /// else is dispatched to the models matching the destination.
    pub fn dispatch(
        &mut self,
        timers: &dyn TimerService,
        pdu: &AccessPdu,
        src: Address,
        dst: &MeshAddress,
        key_set: KeySet,
    ) -> DispatchResult {
        // Response correlation first: (opcode, src, dst, key set).
        if let Some(index) = self.correlate(pdu, src, dst.address(), key_set) {
            let pending = self.pending_responses.remove(index);
            timers.cancel(pending.timer);
            debug!(handle = %pending.handle, %src, "Response correlated");
            if let Some((element, model)) = pending.model {
                self.elements[element].models[model].delegate.on_response(
                    pdu,
                    &pending.request,
                    src,
                );
            }
            return DispatchResult {
                responses: Vec::new(),
                handled: true,
            };
        }

        let mut result = DispatchResult::default();
        for element_index in 0..self.elements.len() {
            let element_address = self.elements[element_index].address;
            let deliver_here = if dst.address().is_unicast() {
                dst.address() == element_address
            } else {
                dst.address() == Address::ALL_NODES
                    || self.elements[element_index]
                        .models
                        .iter()
                        .any(|m| m.subscribed_to(dst.address()))
            };
            if !deliver_here {
                continue;
            }

            for model_index in 0..self.elements[element_index].models.len() {
                let model = &mut self.elements[element_index].models[model_index];
                let kind = match model.opcode_map.get(&pdu.opcode) {
                    Some(kind) => *kind,
                    None => continue,
                };
                // Group and virtual destinations require a subscription.
                if !dst.address().is_unicast()
                    && dst.address() != Address::ALL_NODES
                    && !model.subscribed_to(dst.address())
                {
                    continue;
                }
                result.handled = true;
                match kind {
                    MessageKind::Acknowledged => {
                        let response = model.delegate.on_acknowledged(pdu, src, dst);
                        result.responses.push(ResponseMessage {
                            pdu: response,
                            src: element_address,
                            dst: MeshAddress::new(src),
                            key_set,
                        });
                    }
                    MessageKind::Unacknowledged | MessageKind::Response => {
                        model.delegate.on_unacknowledged(pdu, src, dst);
                    }
                }
            }
        }
        result
    }

    fn correlate(
        &self,
        pdu: &AccessPdu,
        src: Address,
        dst: Address,
        key_set: KeySet,
    ) -> Option<usize> {
        self.pending_responses.iter().position(|pending| {
            if pending.peer != src || pending.local != dst || pending.key_set != key_set {
                return false;
            }
            match pending.model {
                Some((element, model)) => {
                    let model = &self.elements[element].models[model];
                    matches!(model.opcode_map.get(&pdu.opcode), Some(MessageKind::Response))
                }
                // A request sent without a local model accepts any opcode
                // from the right peer under the right keys.
                None => true,
            }
        })
    }

    fn find_requesting_model(&self, element: Address, opcode: &Opcode) -> Option<(usize, usize)> {
        let element_index = self.elements.iter().position(|e| e.address == element)?;
        let models = &self.elements[element_index].models;
        // A model declaring the request opcode wins; otherwise any model on
        // the element that can parse responses (a pure client declares only
        // the statuses it expects).
        let model_index = models
            .iter()
            .position(|m| m.opcode_map.contains_key(opcode))
            .or_else(|| {
                models.iter().position(|m| {
                    m.opcode_map
                        .values()
                        .any(|kind| *kind == MessageKind::Response)
                })
            })?;
        Some((element_index, model_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::ManualTimers;
    use mesh_core::KeyIndex;
    use std::sync::mpsc;

    const GET: Opcode = Opcode::Double(0x8201);
    const STATUS: Opcode = Opcode::Double(0x8204);
    const SET_UNACK: Opcode = Opcode::Double(0x8203);

    struct TestModel {
        events: mpsc::Sender<String>,
    }

    impl ModelDelegate for TestModel {
        fn message_types(&self) -> Vec<(Opcode, MessageKind)> {
            vec![
                (GET, MessageKind::Acknowledged),
                (SET_UNACK, MessageKind::Unacknowledged),
                (STATUS, MessageKind::Response),
            ]
        }

        fn on_acknowledged(
            &mut self,
            request: &AccessPdu,
            _src: Address,
            _dst: &MeshAddress,
        ) -> AccessPdu {
            self.events
                .send(format!("ack:{}", request.opcode))
                .unwrap();
            AccessPdu::new(STATUS, vec![0x01])
        }

        fn on_unacknowledged(&mut self, message: &AccessPdu, _src: Address, _dst: &MeshAddress) {
            self.events
                .send(format!("unack:{}", message.opcode))
                .unwrap();
        }

        fn on_response(&mut self, response: &AccessPdu, request: &AccessPdu, _src: Address) {
            self.events
                .send(format!("resp:{}:{}", response.opcode, request.opcode))
                .unwrap();
        }
    }

    const LOCAL: Address = Address(0x0001);
    const PEER: Address = Address(0x0042);
    const KEYS: KeySet = KeySet::Application(KeyIndex::PRIMARY);

    fn layer_with_model() -> (AccessLayer, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let mut layer = AccessLayer::new(AccessConfig::default(), &[LOCAL]);
        layer
            .register_model(0, 0x1000, Vec::new(), Box::new(TestModel { events: tx }))
            .unwrap();
        (layer, rx)
    }

    #[test]
    fn test_acknowledged_dispatch_produces_response() {
        let (mut layer, rx) = layer_with_model();
        let timers = ManualTimers::new();

        let request = AccessPdu::new(GET, vec![]);
        let result = layer.dispatch(
            &*timers,
            &request,
            PEER,
            &MeshAddress::new(LOCAL),
            KEYS,
        );
        assert!(result.handled);
        assert_eq!(result.responses.len(), 1);
        let response = &result.responses[0];
        assert_eq!(response.dst.address(), PEER);
        assert_eq!(response.src, LOCAL);
        assert_eq!(response.key_set, KEYS);
        assert_eq!(rx.try_recv().unwrap(), format!("ack:{GET}"));
    }

    #[test]
    fn test_unacknowledged_dispatch() {
        let (mut layer, rx) = layer_with_model();
        let timers = ManualTimers::new();

        let result = layer.dispatch(
            &*timers,
            &AccessPdu::new(SET_UNACK, vec![0x00]),
            PEER,
            &MeshAddress::new(LOCAL),
            KEYS,
        );
        assert!(result.handled);
        assert!(result.responses.is_empty());
        assert_eq!(rx.try_recv().unwrap(), format!("unack:{SET_UNACK}"));
    }

    #[test]
    fn test_unknown_opcode_unhandled() {
        let (mut layer, _rx) = layer_with_model();
        let timers = ManualTimers::new();

        let result = layer.dispatch(
            &*timers,
            &AccessPdu::new(Opcode::Single(0x01), vec![]),
            PEER,
            &MeshAddress::new(LOCAL),
            KEYS,
        );
        assert!(!result.handled);
    }

    #[test]
    fn test_response_correlation() {
        let (mut layer, rx) = layer_with_model();
        let timers = ManualTimers::new();

        // Send an acknowledged GET to the peer.
        let (_, message) = layer.enqueue(
            AccessPdu::new(GET, vec![]),
            LOCAL,
            MeshAddress::new(PEER),
            KEYS,
            None,
            true,
        );
        let message = message.expect("idle destination transmits at once");
        layer.await_response(&*timers, &message);
        layer.transmit_complete(PEER);

        // The status from the peer correlates, completes the pending
        // request and is not re-dispatched.
        let result = layer.dispatch(
            &*timers,
            &AccessPdu::new(STATUS, vec![0x01]),
            PEER,
            &MeshAddress::new(LOCAL),
            KEYS,
        );
        assert!(result.handled);
        assert!(result.responses.is_empty());
        assert_eq!(rx.try_recv().unwrap(), format!("resp:{STATUS}:{GET}"));

        // The pending entry is gone: the timeout later is a no-op.
        assert!(!layer.response_timeout(message.handle));
        // And its timer was cancelled.
        assert!(timers
            .pop_matching(|e| matches!(e, TimerEvent::ResponseTimeout(_)))
            .is_none());
    }

    #[test]
    fn test_response_requires_matching_key_set() {
        let (mut layer, rx) = layer_with_model();
        let timers = ManualTimers::new();

        let (_, message) = layer.enqueue(
            AccessPdu::new(GET, vec![]),
            LOCAL,
            MeshAddress::new(PEER),
            KEYS,
            None,
            true,
        );
        layer.await_response(&*timers, &message.unwrap());

        // Same opcode and peer, different key set: dispatched as an
        // unsolicited status, not a correlation.
        let result = layer.dispatch(
            &*timers,
            &AccessPdu::new(STATUS, vec![0x01]),
            PEER,
            &MeshAddress::new(LOCAL),
            KeySet::Device,
        );
        assert!(result.handled);
        assert_eq!(rx.try_recv().unwrap(), format!("unack:{STATUS}"));
    }

    #[test]
    fn test_per_destination_fifo() {
        let (mut layer, _rx) = layer_with_model();

        let (h1, first) = layer.enqueue(
            AccessPdu::new(GET, vec![]),
            LOCAL,
            MeshAddress::new(PEER),
            KEYS,
            None,
            false,
        );
        assert!(first.is_some());
        let (h2, second) = layer.enqueue(
            AccessPdu::new(GET, vec![1]),
            LOCAL,
            MeshAddress::new(PEER),
            KEYS,
            None,
            false,
        );
        // Second message waits for the first.
        assert!(second.is_none());
        assert_ne!(h1, h2);

        // A different destination is not blocked.
        let (_, other) = layer.enqueue(
            AccessPdu::new(GET, vec![2]),
            LOCAL,
            MeshAddress::new(Address(0x0055)),
            KEYS,
            None,
            false,
        );
        assert!(other.is_some());

        let next = layer.transmit_complete(PEER).expect("second dequeues");
        assert_eq!(next.handle, h2);
        assert!(layer.transmit_complete(PEER).is_none());
    }

    #[test]
    fn test_cancel_queued_and_pending() {
        let (mut layer, _rx) = layer_with_model();
        let timers = ManualTimers::new();

        let (h1, _) = layer.enqueue(
            AccessPdu::new(GET, vec![]),
            LOCAL,
            MeshAddress::new(PEER),
            KEYS,
            None,
            false,
        );
        let (h2, _) = layer.enqueue(
            AccessPdu::new(GET, vec![1]),
            LOCAL,
            MeshAddress::new(PEER),
            KEYS,
            None,
            false,
        );

        assert_eq!(layer.cancel(&*timers, h2), CancelOutcome::Dequeued);
        assert_eq!(layer.cancel(&*timers, h1), CancelOutcome::InFlight(PEER));
        assert_eq!(layer.cancel(&*timers, h1), CancelOutcome::NotFound);
    }

    #[test]
    fn test_group_dispatch_requires_subscription() {
        let (mut layer, rx) = layer_with_model();
        let timers = ManualTimers::new();
        let group = MeshAddress::new(Address(0xC010));

        // Not subscribed: nothing happens.
        let result = layer.dispatch(
            &*timers,
            &AccessPdu::new(SET_UNACK, vec![]),
            PEER,
            &group,
            KEYS,
        );
        assert!(!result.handled);

        layer.subscribe(0, 0x1000, group).unwrap();
        let result = layer.dispatch(
            &*timers,
            &AccessPdu::new(SET_UNACK, vec![]),
            PEER,
            &group,
            KEYS,
        );
        assert!(result.handled);
        assert_eq!(rx.try_recv().unwrap(), format!("unack:{SET_UNACK}"));

        // All-nodes reaches every element without subscription.
        let result = layer.dispatch(
            &*timers,
            &AccessPdu::new(SET_UNACK, vec![]),
            PEER,
            &MeshAddress::new(Address::ALL_NODES),
            KEYS,
        );
        assert!(result.handled);
    }

    #[test]
    fn test_subscribed_labels() {
        let (mut layer, _rx) = layer_with_model();
        let label = Uuid::from_bytes([0x3C; 16]);
        let va = MeshAddress::with_label(label);
        layer.subscribe(0, 0x1000, va).unwrap();

        assert_eq!(layer.subscribed_labels(va.address()), vec![label]);
        assert!(layer.subscribed_labels(Address(0x8000)).is_empty()
            || va.address() == Address(0x8000));
    }

    #[test]
    fn test_response_timeout_reports_once() {
        let (mut layer, _rx) = layer_with_model();
        let timers = ManualTimers::new();

        let (_, message) = layer.enqueue(
            AccessPdu::new(GET, vec![]),
            LOCAL,
            MeshAddress::new(PEER),
            KEYS,
            None,
            true,
        );
        let message = message.unwrap();
        layer.await_response(&*timers, &message);

        assert!(layer.response_timeout(message.handle));
        assert!(!layer.response_timeout(message.handle));
    }
}
