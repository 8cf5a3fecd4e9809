//! Configuration API errors.
//!
//! Unlike the protocol layers, configuration problems are surfaced to the
//! API caller; nothing here is silently dropped.

use thiserror::Error;

/// Errors from configuration mutation and import.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A key index above the 12-bit range.
    #[error("Key index {0} out of range")]
    KeyIndexOutOfRange(u16),

    /// The requested unicast span collides with an existing node.
    #[error("Address 0x{0:04X} is not available")]
    AddressNotAvailable(u16),

    /// Two provisioners would own overlapping allocated ranges.
    #[error("Provisioner ranges overlap")]
    OverlappingProvisionerRanges,

    /// No gap in the allocated ranges fits the requested element span.
    #[error("No address available for {0} elements")]
    NoAddressAvailable(u8),

    /// A range with low above high, or outside its address class.
    #[error("Invalid range")]
    InvalidRange,

    /// The provisioner UUID is already in use.
    #[error("Provisioner is used in another network")]
    ProvisionerUsedInAnotherNetwork,

    /// The provisioner is not part of this network.
    #[error("Provisioner not in network")]
    ProvisionerNotInNetwork,

    /// A node with this UUID already exists.
    #[error("Node already exists")]
    NodeAlreadyExists,

    /// The JSON document did not parse.
    #[error("Invalid configuration document: {0}")]
    InvalidDocument(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(error: serde_json::Error) -> Self {
        ConfigError::InvalidDocument(error.to_string())
    }
}

impl From<hex::FromHexError> for ConfigError {
    fn from(error: hex::FromHexError) -> Self {
        ConfigError::InvalidDocument(error.to_string())
    }
}
