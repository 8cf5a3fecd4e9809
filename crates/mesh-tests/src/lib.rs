//! Integration test harness for the mesh stack.
//!
//! Provides:
//! - [`TestNode`]: a manager wired to an in-memory bearer, a recording
//!   delegate and deterministic timers
//! - [`exchange`]: pumps PDUs between two nodes until the air is quiet
//! - [`DeviceSimulator`]: the device side of the provisioning handshake,
//!   built from the same crypto primitives

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod device;
pub mod harness;

pub use device::DeviceSimulator;
pub use harness::{exchange, DelegateEvent, TestNode};
