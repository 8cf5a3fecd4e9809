//! The mesh protocol engine.
//!
//! Implements the stateful side of the stack:
//! - Network layer: key trial, replay cache, sequence allocation
//! - Lower transport: segmentation and reassembly with timers
//! - Upper transport: key selection on send and receive
//! - Access layer: model dispatch, outbound queue, response correlation
//! - Secure Network Beacon handling and the IV-Index state machine
//! - The provisioner-side provisioning handshake
//!
//! Everything runs on one logical queue: the host feeds bearer PDUs and
//! timer events into a [`MeshManager`] and receives delegate callbacks.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod access;
pub mod bearer;
pub mod beacon;
pub mod error;
pub mod keystore;
pub mod lower;
pub mod manager;
pub mod network;
pub mod provisioning;
pub mod replay;
pub mod sequence;
pub mod timers;
pub mod upper;

pub use access::{
    AccessConfig, MessageHandle, MessageKind, ModelDelegate, RegistryError,
};
pub use bearer::{Bearer, BearerError, PduType};
pub use beacon::{BeaconHandler, BeaconOutcome, IvPolicy, IvState, KeyRefreshAction};
pub use error::SendError;
pub use keystore::{KeyStore, LocalNode};
pub use lower::{OutboundSarConfig, ReassemblyConfig, SarKey};
pub use manager::{ManagerConfig, ManagerDelegate, MeshManager, SendOptions};
pub use provisioning::{
    ProvisioningAuth, ProvisioningConfig, ProvisioningError, ProvisioningResult,
    ProvisioningSession, ProvisioningStep,
};
pub use timers::{ManualTimers, TimerEvent, TimerHandle, TimerService, TokioTimers};
pub use upper::KeySet;
