//! Proxy configuration messages (Mesh Profile §6.5).
//!
//! These ride the GATT bearer inside network PDUs sealed with the proxy
//! nonce (CTL = 1, TTL = 0, unassigned destination) and manage the proxy's
//! output filter.

use mesh_core::Address;
use thiserror::Error;

/// Errors from proxy configuration decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyConfigError {
    /// Message shorter than its opcode or fixed fields
    #[error("Proxy configuration message too short: {0} bytes")]
    TooShort(usize),

    /// Unknown opcode
    #[error("Unknown proxy configuration opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    /// Address list does not divide into 16-bit entries
    #[error("Truncated address list")]
    TruncatedAddressList,
}

/// The proxy filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterType {
    /// Accept destinations in the list (default).
    Accept = 0x00,
    /// Reject destinations in the list.
    Reject = 0x01,
}

/// A proxy configuration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfiguration {
    /// Resets the filter to the given type with an empty list (0x00).
    SetFilterType(FilterType),
    /// Adds addresses to the filter list (0x01).
    AddAddresses(Vec<Address>),
    /// Removes addresses from the filter list (0x02).
    RemoveAddresses(Vec<Address>),
    /// The proxy's report: filter type and list size (0x03).
    FilterStatus {
        /// Active filter type.
        filter_type: FilterType,
        /// Number of addresses in the list.
        list_size: u16,
    },
}

impl ProxyConfiguration {
    /// Encodes the message as a proxy PDU payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ProxyConfiguration::SetFilterType(filter_type) => vec![0x00, *filter_type as u8],
            ProxyConfiguration::AddAddresses(addresses) => encode_list(0x01, addresses),
            ProxyConfiguration::RemoveAddresses(addresses) => encode_list(0x02, addresses),
            ProxyConfiguration::FilterStatus {
                filter_type,
                list_size,
            } => {
                let mut out = vec![0x03, *filter_type as u8];
                out.extend_from_slice(&list_size.to_be_bytes());
                out
            }
        }
    }

    /// Decodes a proxy PDU payload.
    pub fn decode(data: &[u8]) -> Result<Self, ProxyConfigError> {
        let (&opcode, parameters) = data.split_first().ok_or(ProxyConfigError::TooShort(0))?;
        match opcode {
            0x00 => match parameters {
                [filter] => Ok(ProxyConfiguration::SetFilterType(decode_filter(*filter)?)),
                _ => Err(ProxyConfigError::TooShort(data.len())),
            },
            0x01 => Ok(ProxyConfiguration::AddAddresses(decode_list(parameters)?)),
            0x02 => Ok(ProxyConfiguration::RemoveAddresses(decode_list(parameters)?)),
            0x03 => {
                if parameters.len() != 3 {
                    return Err(ProxyConfigError::TooShort(data.len()));
                }
                Ok(ProxyConfiguration::FilterStatus {
                    filter_type: decode_filter(parameters[0])?,
                    list_size: u16::from_be_bytes([parameters[1], parameters[2]]),
                })
            }
            other => Err(ProxyConfigError::UnknownOpcode(other)),
        }
    }
}

fn decode_filter(octet: u8) -> Result<FilterType, ProxyConfigError> {
    match octet {
        0x00 => Ok(FilterType::Accept),
        0x01 => Ok(FilterType::Reject),
        other => Err(ProxyConfigError::UnknownOpcode(other)),
    }
}

fn encode_list(opcode: u8, addresses: &[Address]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + addresses.len() * 2);
    out.push(opcode);
    for address in addresses {
        out.extend_from_slice(&address.to_be_bytes());
    }
    out
}

fn decode_list(data: &[u8]) -> Result<Vec<Address>, ProxyConfigError> {
    if data.len() % 2 != 0 {
        return Err(ProxyConfigError::TruncatedAddressList);
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| Address::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
