//! Core types and cryptographic primitives for the mesh stack.
//!
//! This crate provides:
//! - The security toolbox (AES-CMAC, CCM, ECDH, k1-k4 derivations)
//! - Addresses, including virtual-label hashing
//! - Network/application/device keys with derived material
//! - The IV-Index state pair
//! - Timestamps for dwell-time accounting

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod address;
pub mod crypto;
pub mod ivindex;
pub mod keys;
pub mod node;
pub mod time;

pub use address::{virtual_address, Address, MeshAddress};
pub use ivindex::IvIndex;
pub use keys::{
    ApplicationKey, DeviceKey, KeyIndex, KeyIndexOutOfRange, KeyRefreshPhase, NetworkKey,
    NetworkKeyDerivatives,
};
pub use node::{Features, Node};
pub use time::Timestamp;

/// Maximum TTL of a network PDU.
pub const MAX_TTL: u8 = 127;

/// Sequence numbers are 24-bit; this is the first invalid value.
pub const SEQUENCE_LIMIT: u32 = 0x100_0000;

/// Default sequence threshold past which the node asks for an IV-Update.
pub const DEFAULT_IV_UPDATE_THRESHOLD: u32 = 0x80_0000;
