//! The bearer interface.
//!
//! The core sees whole PDUs; advertising and GATT proxy framing (including
//! SAR of proxy PDUs) belongs to the bearer implementation. Inbound PDUs
//! enter through [`crate::manager::MeshManager::handle_pdu`].

use std::fmt;

use thiserror::Error;

/// What kind of PDU crosses the bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduType {
    /// A network PDU.
    NetworkPdu,
    /// A mesh beacon.
    MeshBeacon,
    /// A proxy configuration PDU (GATT bearer only).
    ProxyConfiguration,
    /// A provisioning PDU (PB-ADV or PB-GATT).
    ProvisioningPdu,
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PduType::NetworkPdu => "network",
            PduType::MeshBeacon => "beacon",
            PduType::ProxyConfiguration => "proxy-configuration",
            PduType::ProvisioningPdu => "provisioning",
        };
        f.write_str(name)
    }
}

/// Errors a bearer may report for a send.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BearerError {
    /// The bearer connection is gone.
    #[error("Bearer closed")]
    Closed,

    /// The bearer does not carry this PDU type (e.g. provisioning over a
    /// proxy-only link).
    #[error("PDU type {0} not supported by this bearer")]
    Unsupported(PduType),

    /// Transient transmit failure; flow-controlled bearers use this for
    /// backpressure.
    #[error("Transmit failed: {0}")]
    TransmitFailed(String),
}

/// Outbound half of a bearer.
///
/// `send` hands over one whole PDU; ordering is preserved per bearer.
pub trait Bearer: Send {
    /// Transmits a PDU.
    fn send(&mut self, pdu: &[u8], pdu_type: PduType) -> Result<(), BearerError>;
}
