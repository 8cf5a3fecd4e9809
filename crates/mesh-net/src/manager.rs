//! The mesh manager: one object owning the whole pipeline.
//!
//! All state mutation happens through `&mut self`; the host serializes
//! calls onto one logical queue, the profile's single-threaded cooperative
//! model. Bearer PDUs come in through [`MeshManager::handle_pdu`], timer
//! events through [`MeshManager::handle_timer`], application sends through
//! [`MeshManager::send`]; delegate callbacks go out synchronously and the
//! host forwards them to its own notification queue.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::{
    Address, IvIndex, KeyIndex, MeshAddress, Node, Timestamp, DEFAULT_IV_UPDATE_THRESHOLD,
};
use mesh_proto::access::AccessPdu;
use mesh_proto::beacon::{BeaconPdu, UnprovisionedBeacon};
use mesh_proto::lower::{seq_zero_of, Heartbeat, LowerTransportPdu, OPCODE_HEARTBEAT};
use mesh_proto::network::{NetworkNonce, NetworkPdu};
use mesh_proto::provisioning::ProvisioningPdu;
use mesh_proto::proxy::ProxyConfiguration;
use mesh_proto::upper::{plan_access_message, seal_access_payload, AccessKey};
use tracing::{debug, trace, warn};

use crate::access::{
    AccessConfig, AccessLayer, CancelOutcome, MessageHandle, ModelDelegate, OutgoingMessage,
    RegistryError,
};
use crate::bearer::{Bearer, PduType};
use crate::beacon::{BeaconHandler, BeaconOutcome, IvPolicy, IvState, KeyRefreshAction};
use crate::error::SendError;
use crate::keystore::{KeyStore, LocalNode};
use crate::lower::{
    AckOutcome, InboundSegmentation, OutboundMeta, OutboundSarConfig, OutboundSegmentation,
    ReassemblyConfig, RetransmitOutcome, SegmentAckAction,
};
use crate::network::NetworkLayer;
use crate::provisioning::{
    ProvisioningConfig, ProvisioningError, ProvisioningResult, ProvisioningSession,
};
use crate::timers::{TimerEvent, TimerHandle, TimerService};
use crate::upper::{self, InboundContext, KeySet};

/// Manager tuning.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// TTL applied when a send does not override it.
    pub default_ttl: u8,
    /// Sequence threshold past which an IV-Update is requested.
    pub seq_threshold: u32,
    /// Access-layer (response timeout) tuning.
    pub access: AccessConfig,
    /// Inbound reassembly tuning.
    pub reassembly: ReassemblyConfig,
    /// Outbound SAR tuning.
    pub outbound_sar: OutboundSarConfig,
    /// IV-Index acceptance policy.
    pub iv_policy: IvPolicy,
    /// Per-step provisioning link timeout.
    pub provisioning_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            seq_threshold: DEFAULT_IV_UPDATE_THRESHOLD,
            access: AccessConfig::default(),
            reassembly: ReassemblyConfig::default(),
            outbound_sar: OutboundSarConfig::default(),
            iv_policy: IvPolicy::default(),
            provisioning_timeout: Duration::from_secs(60),
        }
    }
}

/// Options of one send.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// TTL override.
    pub ttl: Option<u8>,
    /// True for acknowledged messages: a response is awaited and its
    /// absence reported as a timeout.
    pub acknowledged: bool,
}

/// Host-facing callbacks.
///
/// Invoked synchronously on the manager's queue; implementations post to
/// their own notification queue rather than calling back into the manager.
pub trait ManagerDelegate: Send {
    /// An access message was received (models are dispatched separately).
    fn on_message_received(
        &mut self,
        message: &AccessPdu,
        src: Address,
        dst: &MeshAddress,
        key_set: KeySet,
    );

    /// A sent message finished transmission (segments all acknowledged
    /// for segmented messages).
    fn on_message_delivered(&mut self, handle: MessageHandle);

    /// A sent message failed or was cancelled.
    fn on_message_failed(&mut self, handle: MessageHandle, error: SendError);

    /// A heartbeat control message arrived.
    fn on_heartbeat(&mut self, _heartbeat: &Heartbeat, _src: Address, _hops: u8) {}

    /// An unprovisioned device beacon was observed.
    fn on_unprovisioned_beacon(&mut self, _beacon: &UnprovisionedBeacon) {}

    /// A proxy filter status (or other proxy configuration) arrived.
    fn on_proxy_configuration(&mut self, _message: &ProxyConfiguration, _src: Address) {}

    /// The IV-Index advanced (beacon-driven or locally initiated).
    fn on_iv_index_changed(&mut self, _iv: IvIndex) {}

    /// Provisioning finished; the node has been added to the key store.
    fn on_provisioning_complete(&mut self, _result: &ProvisioningResult) {}

    /// Provisioning aborted. Reported exactly once per session.
    fn on_provisioning_failed(&mut self, _error: &ProvisioningError) {}
}

/// The protocol engine.
pub struct MeshManager {
    config: ManagerConfig,
    bearer: Box<dyn Bearer>,
    timers: Arc<dyn TimerService>,
    delegate: Box<dyn ManagerDelegate>,
    keys: KeyStore,
    network: NetworkLayer,
    inbound: InboundSegmentation,
    outbound: OutboundSegmentation,
    access: AccessLayer,
    beacons: BeaconHandler,
    provisioning: Option<ProvisioningSession>,
    provisioning_timer: Option<TimerHandle>,
    iv_update_requested: bool,
}

impl MeshManager {
    /// Creates the engine for a local node.
    pub fn new(
        config: ManagerConfig,
        local: LocalNode,
        iv_state: IvState,
        bearer: Box<dyn Bearer>,
        timers: Arc<dyn TimerService>,
        delegate: Box<dyn ManagerDelegate>,
    ) -> Self {
        let element_addresses: Vec<Address> = (0..local.element_count.max(1))
            .filter_map(|index| local.element_address(index))
            .collect();
        Self {
            bearer,
            timers,
            delegate,
            keys: KeyStore::new(local),
            network: NetworkLayer::new(config.seq_threshold),
            inbound: InboundSegmentation::new(config.reassembly),
            outbound: OutboundSegmentation::new(config.outbound_sar),
            access: AccessLayer::new(config.access, &element_addresses),
            beacons: BeaconHandler::new(iv_state, config.iv_policy),
            provisioning: None,
            provisioning_timer: None,
            iv_update_requested: false,
            config,
        }
    }

    /// The key store, for host configuration.
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Mutable key store access.
    pub fn keys_mut(&mut self) -> &mut KeyStore {
        &mut self.keys
    }

    /// The current IV-Index pair.
    pub fn iv(&self) -> IvIndex {
        self.beacons.iv()
    }

    /// Registers a model on a local element.
    pub fn register_model(
        &mut self,
        element_index: u8,
        model_id: u32,
        subscriptions: Vec<MeshAddress>,
        delegate: Box<dyn ModelDelegate>,
    ) -> Result<(), RegistryError> {
        self.access
            .register_model(element_index, model_id, subscriptions, delegate)
    }

    /// Adds a subscription to a registered model.
    pub fn subscribe(
        &mut self,
        element_index: u8,
        model_id: u32,
        address: MeshAddress,
    ) -> Result<(), RegistryError> {
        self.access.subscribe(element_index, model_id, address)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queues an access message for transmission.
    ///
    /// Returns immediately with a handle usable for [`Self::cancel`];
    /// delivery or failure is reported through the delegate.
    pub fn send(
        &mut self,
        pdu: AccessPdu,
        element_index: u8,
        dst: MeshAddress,
        key_set: KeySet,
        options: SendOptions,
    ) -> Result<MessageHandle, SendError> {
        let src = self
            .keys
            .local()
            .element_address(element_index)
            .ok_or(SendError::InvalidMessage)?;
        let (handle, ready) = self.access.enqueue(
            pdu,
            src,
            dst,
            key_set,
            options.ttl,
            options.acknowledged,
        );
        self.drive(ready);
        Ok(handle)
    }

    /// Cancels a queued or in-flight message.
    ///
    /// The failure callback fires exactly once with [`SendError::Cancelled`];
    /// frames already handed to the bearer are not recalled.
    pub fn cancel(&mut self, handle: MessageHandle) {
        match self.access.cancel(&*self.timers, handle) {
            CancelOutcome::NotFound => {}
            CancelOutcome::Dequeued | CancelOutcome::AwaitingResponse => {
                self.delegate.on_message_failed(handle, SendError::Cancelled);
            }
            CancelOutcome::InFlight(dst) => {
                self.outbound.cancel(&*self.timers, handle);
                self.delegate.on_message_failed(handle, SendError::Cancelled);
                let next = self.access.transmit_complete(dst);
                self.drive(next);
            }
        }
    }

    /// Sends a proxy configuration message over the GATT bearer.
    pub fn send_proxy_configuration(
        &mut self,
        message: &ProxyConfiguration,
        network_key: KeyIndex,
    ) -> Result<(), SendError> {
        let src = self.keys.local().primary_unicast;
        let creds = *self
            .keys
            .network_key(network_key)
            .ok_or(SendError::UnknownKey)?
            .transmit_keys();
        let allocation = self
            .network
            .next_seq(src)
            .map_err(|_| SendError::SequenceExhausted)?;

        let pdu = NetworkPdu {
            ctl: true,
            ttl: 0,
            seq: allocation.seq,
            src,
            dst: Address::UNASSIGNED,
            transport_pdu: message.encode(),
        };
        let sealed = pdu
            .seal(&creds, self.beacons.iv().transmit_index(), NetworkNonce::Proxy)
            .map_err(|_| SendError::InvalidMessage)?;
        self.bearer.send(&sealed, PduType::ProxyConfiguration)?;
        Ok(())
    }

    /// Transmits messages until one stays in flight or the queue drains.
    fn drive(&mut self, mut current: Option<OutgoingMessage>) {
        while let Some(message) = current {
            let dst = message.dst.address();
            match self.transmit(&message) {
                // Segmented transmission continues under SAR timers.
                Ok(true) => break,
                Ok(false) => {
                    self.delegate.on_message_delivered(message.handle);
                    if message.acknowledged {
                        self.access.await_response(&*self.timers, &message);
                    }
                    current = self.access.transmit_complete(dst);
                }
                Err(error) => {
                    debug!(handle = %message.handle, %error, "Transmit failed");
                    self.delegate.on_message_failed(message.handle, error);
                    current = self.access.transmit_complete(dst);
                }
            }
        }
        self.maybe_begin_iv_update();
    }

    /// Seals and sends one queued message. `Ok(true)` means a segmented
    /// transfer is now in flight.
    fn transmit(&mut self, message: &OutgoingMessage) -> Result<bool, SendError> {
        let payload = message.pdu.encode().map_err(|_| SendError::InvalidMessage)?;
        let plan = plan_access_message(payload.len()).map_err(|_| SendError::PayloadTooLong)?;

        let iv = self.beacons.iv();
        if plan.segmented && iv.update_active {
            return Err(SendError::IvUpdateInProgress);
        }

        let (key_bytes, is_device, aid, network_key) = {
            let (key, aid, index) =
                upper::select_outbound_key(&self.keys, message.key_set, message.dst.address())
                    .ok_or(SendError::UnknownKey)?;
            match key {
                AccessKey::Application(bytes) => (*bytes, false, aid, index),
                AccessKey::Device(bytes) => (*bytes, true, aid, index),
            }
        };
        let creds = *self
            .keys
            .network_key(network_key)
            .ok_or(SendError::UnknownKey)?
            .transmit_keys();

        let ttl = message.ttl.unwrap_or(self.config.default_ttl);
        let allocation = self
            .network
            .next_seq(message.src)
            .map_err(|_| SendError::SequenceExhausted)?;
        if allocation.iv_update_needed {
            self.iv_update_requested = true;
        }
        let seq = allocation.seq;

        let access_key = if is_device {
            AccessKey::Device(&key_bytes)
        } else {
            AccessKey::Application(&key_bytes)
        };
        let upper_pdu = seal_access_payload(
            access_key,
            plan.szmic,
            seq,
            message.src,
            &message.dst,
            iv.transmit_index(),
            &payload,
        )
        .map_err(|_| SendError::InvalidMessage)?;

        if !plan.segmented {
            let transport = LowerTransportPdu::UnsegmentedAccess {
                aid,
                upper_pdu,
            }
            .encode()
            .map_err(|_| SendError::InvalidMessage)?;
            let sealed = NetworkPdu {
                ctl: false,
                ttl,
                seq,
                src: message.src,
                dst: message.dst.address(),
                transport_pdu: transport,
            }
            .seal(&creds, iv.transmit_index(), NetworkNonce::Network)
            .map_err(|_| SendError::InvalidMessage)?;
            self.bearer.send(&sealed, PduType::NetworkPdu)?;
            return Ok(false);
        }

        let meta = OutboundMeta {
            handle: message.handle,
            src: message.src,
            dst: message.dst.address(),
            ttl,
            network_key,
            aid,
            szmic: plan.szmic,
            seq_zero: seq_zero_of(seq),
        };
        let segments = self.outbound.start(&*self.timers, meta, &upper_pdu);
        for (index, segment) in segments.iter().enumerate() {
            // The first segment reuses the sequence the nonce was built
            // from; the rest allocate fresh ones.
            let segment_seq = if index == 0 {
                seq
            } else {
                self.network
                    .next_seq(message.src)
                    .map_err(|_| SendError::SequenceExhausted)?
                    .seq
            };
            if let Err(error) =
                self.send_segment(segment, &creds, segment_seq, message.src, meta.dst, ttl)
            {
                self.outbound.cancel(&*self.timers, message.handle);
                return Err(error);
            }
        }
        Ok(true)
    }

    fn send_segment(
        &mut self,
        segment: &LowerTransportPdu,
        creds: &mesh_core::NetworkKeyDerivatives,
        seq: u32,
        src: Address,
        dst: Address,
        ttl: u8,
    ) -> Result<(), SendError> {
        let transport = segment.encode().map_err(|_| SendError::InvalidMessage)?;
        let sealed = NetworkPdu {
            ctl: false,
            ttl,
            seq,
            src,
            dst,
            transport_pdu: transport,
        }
        .seal(
            creds,
            self.beacons.iv().transmit_index(),
            NetworkNonce::Network,
        )
        .map_err(|_| SendError::InvalidMessage)?;
        self.bearer.send(&sealed, PduType::NetworkPdu)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Entry point for every PDU the bearer delivers.
    pub fn handle_pdu(&mut self, data: &[u8], pdu_type: PduType) {
        match pdu_type {
            PduType::NetworkPdu => self.handle_network_pdu(data, NetworkNonce::Network),
            PduType::ProxyConfiguration => self.handle_network_pdu(data, NetworkNonce::Proxy),
            PduType::MeshBeacon => self.handle_beacon(data),
            PduType::ProvisioningPdu => self.handle_provisioning_pdu(data),
        }
    }

    /// Entry point for fired timers.
    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::InboundAck(key) => {
                if let Some(ack) = self.inbound.ack_timer_fired(key) {
                    self.send_segment_ack(&ack);
                }
            }
            TimerEvent::InboundIncomplete(key) => {
                self.inbound.incomplete_timer_fired(&*self.timers, key);
            }
            TimerEvent::OutboundRetransmit(handle) => {
                match self.outbound.retransmit_timer_fired(&*self.timers, handle) {
                    RetransmitOutcome::Unknown => {}
                    RetransmitOutcome::TimedOut(handle) => {
                        self.finish_segmented(handle, Err(SendError::Timeout));
                    }
                    RetransmitOutcome::Retransmit(handle, segments) => {
                        self.retransmit(handle, &segments);
                    }
                }
            }
            TimerEvent::ResponseTimeout(handle) => {
                if self.access.response_timeout(handle) {
                    self.delegate.on_message_failed(handle, SendError::Timeout);
                }
            }
            TimerEvent::ProvisioningTimeout => {
                let timeout = self.provisioning.as_mut().and_then(|s| s.handle_timeout());
                if let Some(error) = timeout {
                    self.abort_provisioning(error);
                }
            }
        }
    }

    fn handle_network_pdu(&mut self, data: &[u8], nonce: NetworkNonce) {
        let inbound = match self.network.open_incoming(
            self.keys.network_keys(),
            self.beacons.iv(),
            data,
            nonce,
        ) {
            Some(inbound) => inbound,
            None => return,
        };
        let pdu = inbound.pdu;

        if nonce == NetworkNonce::Proxy {
            if let Ok(message) = ProxyConfiguration::decode(&pdu.transport_pdu) {
                self.delegate.on_proxy_configuration(&message, pdu.src);
            }
            return;
        }

        let lower = match LowerTransportPdu::decode(pdu.ctl, &pdu.transport_pdu) {
            Ok(lower) => lower,
            Err(error) => {
                trace!(%error, "Undecodable lower-transport PDU dropped");
                return;
            }
        };

        match lower {
            LowerTransportPdu::SegmentAck {
                seq_zero,
                block_ack,
                ..
            } => match self
                .outbound
                .handle_ack(&*self.timers, pdu.src, seq_zero, block_ack)
            {
                AckOutcome::NotMine => {}
                AckOutcome::Busy(handle) => {
                    self.finish_segmented(handle, Err(SendError::Busy));
                }
                AckOutcome::Completed(handle) => {
                    self.finish_segmented(handle, Ok(()));
                }
                AckOutcome::Retransmit(handle, segments) => {
                    self.retransmit(handle, &segments);
                }
            },
            LowerTransportPdu::UnsegmentedAccess { aid, upper_pdu } => {
                self.deliver_access(
                    InboundContext {
                        network_key: inbound.network_key,
                        src: pdu.src,
                        dst: pdu.dst,
                        seq: pdu.seq,
                        iv_index: inbound.iv_index,
                        szmic: false,
                        aid,
                    },
                    &upper_pdu,
                );
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                self.deliver_control(opcode, &parameters, pdu.src, pdu.ttl);
            }
            segment @ (LowerTransportPdu::SegmentedAccess { .. }
            | LowerTransportPdu::SegmentedControl { .. }) => {
                let result = self.inbound.handle_segment(
                    &*self.timers,
                    inbound.network_key,
                    pdu.src,
                    pdu.dst,
                    pdu.ttl,
                    pdu.seq,
                    inbound.iv_index,
                    &segment,
                );
                if let Some(ack) = result.ack {
                    self.send_segment_ack(&ack);
                }
                if let Some(message) = result.message {
                    match message.content {
                        crate::lower::ReassembledContent::Access { aid, szmic, payload } => {
                            self.deliver_access(
                                InboundContext {
                                    network_key: inbound.network_key,
                                    src: message.src,
                                    dst: message.dst,
                                    seq: message.seq,
                                    iv_index: message.iv_index,
                                    szmic,
                                    aid,
                                },
                                &payload,
                            );
                        }
                        crate::lower::ReassembledContent::Control { opcode, parameters } => {
                            self.deliver_control(opcode, &parameters, message.src, message.ttl);
                        }
                    }
                }
            }
        }
    }

    fn deliver_access(&mut self, ctx: InboundContext, data: &[u8]) {
        let labels = self.access.subscribed_labels(ctx.dst);
        let decrypted = match upper::open_inbound(&self.keys, &ctx, &labels, data) {
            Some(decrypted) => decrypted,
            None => return,
        };
        let pdu = match AccessPdu::decode(&decrypted.payload) {
            Ok(pdu) => pdu,
            Err(error) => {
                trace!(%error, "Undecodable access PDU dropped");
                return;
            }
        };

        self.delegate
            .on_message_received(&pdu, ctx.src, &decrypted.dst, decrypted.key_set);
        let result = self.access.dispatch(
            &*self.timers,
            &pdu,
            ctx.src,
            &decrypted.dst,
            decrypted.key_set,
        );
        for response in result.responses {
            let (_, ready) = self.access.enqueue(
                response.pdu,
                response.src,
                response.dst,
                response.key_set,
                None,
                false,
            );
            self.drive(ready);
        }
    }

    fn deliver_control(&mut self, opcode: u8, parameters: &[u8], src: Address, ttl: u8) {
        if opcode == OPCODE_HEARTBEAT {
            if let Ok(heartbeat) = Heartbeat::decode(parameters) {
                let hops = mesh_proto::lower::heartbeat_hops(heartbeat.init_ttl, ttl);
                self.delegate.on_heartbeat(&heartbeat, src, hops);
            }
            return;
        }
        trace!(opcode, "Unhandled control opcode");
    }

    fn handle_beacon(&mut self, data: &[u8]) {
        let beacon = match BeaconPdu::decode(data) {
            Ok(beacon) => beacon,
            Err(_) => return,
        };
        match beacon {
            BeaconPdu::Unprovisioned(beacon) => self.delegate.on_unprovisioned_beacon(&beacon),
            BeaconPdu::SecureNetwork(beacon) => {
                let transmit_before = self.beacons.iv().transmit_index();
                let outcome =
                    self.beacons
                        .handle_beacon(&beacon, self.keys.network_keys(), Timestamp::now());
                match outcome {
                    BeaconOutcome::IvChanged {
                        authority,
                        iv,
                        key_refresh,
                    } => {
                        if self.beacons.iv().transmit_index() != transmit_before {
                            self.network.on_iv_index_changed();
                        }
                        self.delegate.on_iv_index_changed(iv);
                        self.apply_key_refresh(authority.network_key, key_refresh);
                    }
                    BeaconOutcome::Unchanged {
                        authority,
                        key_refresh,
                    } => {
                        self.apply_key_refresh(authority.network_key, key_refresh);
                    }
                    BeaconOutcome::NotAuthenticated | BeaconOutcome::Rejected(_) => {}
                }
            }
        }
    }

    fn apply_key_refresh(&mut self, index: KeyIndex, action: Option<KeyRefreshAction>) {
        let now = Timestamp::now();
        if let (Some(action), Some(key)) = (action, self.keys.network_key_mut(index)) {
            match action {
                KeyRefreshAction::Finalize => key.finalize_refresh(now),
                KeyRefreshAction::RevokeOld => key.revoke_old_key(now),
            }
        }
    }

    // ------------------------------------------------------------------
    // Segmented completion plumbing
    // ------------------------------------------------------------------

    fn finish_segmented(&mut self, handle: MessageHandle, outcome: Result<(), SendError>) {
        let message = self.access.in_flight_by_handle(handle).cloned();
        let Some(message) = message else {
            warn!(%handle, "Segmented completion for unknown message");
            return;
        };
        match outcome {
            Ok(()) => {
                self.delegate.on_message_delivered(handle);
                if message.acknowledged {
                    // The response clock starts at the end of transmission.
                    self.access.await_response(&*self.timers, &message);
                }
            }
            Err(error) => self.delegate.on_message_failed(handle, error),
        }
        let next = self.access.transmit_complete(message.dst.address());
        self.drive(next);
    }

    fn retransmit(&mut self, handle: MessageHandle, segments: &[LowerTransportPdu]) {
        let Some(message) = self.access.in_flight_by_handle(handle).cloned() else {
            return;
        };
        let Some((_, _, network_key)) =
            upper::select_outbound_key(&self.keys, message.key_set, message.dst.address())
        else {
            return;
        };
        let Some(creds) = self
            .keys
            .network_key(network_key)
            .map(|k| *k.transmit_keys())
        else {
            return;
        };
        let ttl = message.ttl.unwrap_or(self.config.default_ttl);
        for segment in segments {
            let Ok(allocation) = self.network.next_seq(message.src) else {
                return;
            };
            if self
                .send_segment(
                    segment,
                    &creds,
                    allocation.seq,
                    message.src,
                    message.dst.address(),
                    ttl,
                )
                .is_err()
            {
                return;
            }
        }
    }

    fn send_segment_ack(&mut self, ack: &SegmentAckAction) {
        let Some(creds) = self
            .keys
            .network_key(ack.network_key)
            .map(|k| *k.transmit_keys())
        else {
            return;
        };
        let Ok(allocation) = self.network.next_seq(ack.src) else {
            return;
        };
        let Ok(transport) = (LowerTransportPdu::SegmentAck {
            obo: false,
            seq_zero: ack.seq_zero,
            block_ack: ack.block_ack,
        })
        .encode() else {
            return;
        };
        let pdu = NetworkPdu {
            ctl: true,
            ttl: self.config.default_ttl,
            seq: allocation.seq,
            src: ack.src,
            dst: ack.dst,
            transport_pdu: transport,
        };
        match pdu.seal(
            &creds,
            self.beacons.iv().transmit_index(),
            NetworkNonce::Network,
        ) {
            Ok(sealed) => {
                if let Err(error) = self.bearer.send(&sealed, PduType::NetworkPdu) {
                    trace!(%error, "Segment ack not sent");
                }
            }
            Err(error) => trace!(%error, "Segment ack not sealed"),
        }
    }

    fn maybe_begin_iv_update(&mut self) {
        if !self.iv_update_requested {
            return;
        }
        if self.beacons.begin_iv_update(Timestamp::now()).is_some() {
            self.iv_update_requested = false;
            // The transmit index is unchanged by entering update-active;
            // sequence counters keep running until the update completes.
            self.delegate.on_iv_index_changed(self.beacons.iv());
        }
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Starts provisioning a device over the open provisioning bearer.
    pub fn start_provisioning(&mut self, config: ProvisioningConfig) -> Result<(), SendError> {
        if self.provisioning.is_some() {
            return Err(SendError::Busy);
        }
        let mut session = ProvisioningSession::new(config);
        let invite = session.start().map_err(|_| SendError::InvalidMessage)?;
        self.bearer
            .send(&invite.encode(), PduType::ProvisioningPdu)?;
        self.provisioning = Some(session);
        self.arm_provisioning_timer();
        Ok(())
    }

    /// Supplies the output-OOB value the device displayed.
    pub fn provide_oob_value(&mut self, value: &[u8]) {
        let result = match self.provisioning.as_mut() {
            Some(session) => session.provide_auth_value(value),
            None => return,
        };
        match result {
            Ok(step) => self.apply_provisioning_step(step),
            Err(error) => self.abort_provisioning(error),
        }
    }

    fn handle_provisioning_pdu(&mut self, data: &[u8]) {
        if self.provisioning.is_none() {
            trace!("Provisioning PDU with no session open");
            return;
        }
        let pdu = match ProvisioningPdu::decode(data) {
            Ok(pdu) => pdu,
            Err(error) => {
                self.abort_provisioning(ProvisioningError::from(error));
                return;
            }
        };
        let result = self
            .provisioning
            .as_mut()
            .expect("session checked above")
            .handle_pdu(&pdu);
        match result {
            Ok(step) => self.apply_provisioning_step(step),
            Err(error) => self.abort_provisioning(error),
        }
    }

    fn apply_provisioning_step(&mut self, step: crate::provisioning::ProvisioningStep) {
        for pdu in &step.outgoing {
            if let Err(error) = self.bearer.send(&pdu.encode(), PduType::ProvisioningPdu) {
                trace!(%error, "Provisioning PDU not sent");
                self.abort_provisioning(ProvisioningError::BearerFailed);
                return;
            }
        }
        if let Some(result) = step.result {
            let session = self.provisioning.take().expect("session active");
            self.clear_provisioning_timer();
            let node = Node::new(
                result.device_uuid,
                result.unicast_address,
                result.element_count,
                result.device_key,
                session.network_key_index(),
            );
            self.keys.add_node(node);
            self.delegate.on_provisioning_complete(&result);
            return;
        }
        if !step.outgoing.is_empty() || step.awaiting_oob {
            self.arm_provisioning_timer();
        }
    }

    fn abort_provisioning(&mut self, error: ProvisioningError) {
        if self.provisioning.take().is_some() {
            self.clear_provisioning_timer();
            self.delegate.on_provisioning_failed(&error);
        }
    }

    fn arm_provisioning_timer(&mut self) {
        self.clear_provisioning_timer();
        self.provisioning_timer = Some(
            self.timers
                .schedule(self.config.provisioning_timeout, TimerEvent::ProvisioningTimeout),
        );
    }

    fn clear_provisioning_timer(&mut self) {
        if let Some(timer) = self.provisioning_timer.take() {
            self.timers.cancel(timer);
        }
    }
}
