//! Wire formats and PDU sealing for the mesh stack.
//!
//! This crate defines the stateless halves of the layered pipeline:
//! - Network PDU sealing/opening with header obfuscation
//! - Lower-transport segmentation formats and segment acknowledgements
//! - Upper-transport access-payload encryption
//! - Access opcodes, mesh beacons and provisioning PDUs
//!
//! All state (replay caches, SAR tables, state machines) lives in
//! `mesh-net`; everything here is a pure function of its inputs.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod access;
pub mod beacon;
pub mod lower;
pub mod network;
pub mod provisioning;
pub mod proxy;
pub mod upper;

pub use access::{AccessPdu, AccessPduError, Opcode};
pub use beacon::{node_identity_hash, BeaconPdu, SecureNetworkBeacon, UnprovisionedBeacon};
pub use lower::{seq_auth, seq_from_seq_zero, seq_zero_of, Heartbeat, LowerTransportPdu};
pub use network::{NetworkNonce, NetworkPdu, NetworkPduError};
pub use provisioning::{
    AuthenticationMethod, Capabilities, ProvisioningData, ProvisioningFailureCode, ProvisioningPdu,
    Start,
};
pub use proxy::{FilterType, ProxyConfiguration};
pub use upper::{
    open_access_payload, plan_access_message, seal_access_payload, AccessKey, TransportLayout,
    UpperPduError,
};
