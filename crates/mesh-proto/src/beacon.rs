//! Mesh beacons (Mesh Profile §3.9).
//!
//! Two beacon types reach the core: the unprovisioned device beacon
//! (type `0x00`), which a provisioner scans for, and the Secure Network
//! Beacon (type `0x01`), which drives key refresh and IV-Index evolution.

use mesh_core::crypto::{aes_cmac, aes_encrypt_block};
use mesh_core::{Address, IvIndex};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

/// Beacon type octet of the unprovisioned device beacon.
pub const BEACON_TYPE_UNPROVISIONED: u8 = 0x00;

/// Beacon type octet of the Secure Network Beacon.
pub const BEACON_TYPE_SECURE_NETWORK: u8 = 0x01;

/// Errors from beacon decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BeaconError {
    /// Beacon shorter than its fixed layout
    #[error("Beacon too short: {0} bytes")]
    TooShort(usize),

    /// Unknown beacon type octet
    #[error("Unknown beacon type 0x{0:02X}")]
    UnknownType(u8),
}

/// A decoded mesh beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconPdu {
    /// An unprovisioned device announcing itself.
    Unprovisioned(UnprovisionedBeacon),
    /// A Secure Network Beacon.
    SecureNetwork(SecureNetworkBeacon),
}

impl BeaconPdu {
    /// Decodes a beacon PDU by its type octet.
    pub fn decode(data: &[u8]) -> Result<Self, BeaconError> {
        match *data.first().ok_or(BeaconError::TooShort(0))? {
            BEACON_TYPE_UNPROVISIONED => {
                Ok(BeaconPdu::Unprovisioned(UnprovisionedBeacon::decode(data)?))
            }
            BEACON_TYPE_SECURE_NETWORK => {
                Ok(BeaconPdu::SecureNetwork(SecureNetworkBeacon::decode(data)?))
            }
            other => Err(BeaconError::UnknownType(other)),
        }
    }
}

/// Unprovisioned device beacon: the device UUID plus OOB information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprovisionedBeacon {
    /// Device UUID, the handle used to start provisioning.
    pub device_uuid: Uuid,
    /// OOB information bitmap.
    pub oob_information: u16,
    /// Optional hash of the associated URI advertisement.
    pub uri_hash: Option<[u8; 4]>,
}

impl UnprovisionedBeacon {
    /// Encodes the beacon, type octet included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(23);
        out.push(BEACON_TYPE_UNPROVISIONED);
        out.extend_from_slice(self.device_uuid.as_bytes());
        out.extend_from_slice(&self.oob_information.to_be_bytes());
        if let Some(hash) = &self.uri_hash {
            out.extend_from_slice(hash);
        }
        out
    }

    /// Decodes the beacon, type octet included.
    pub fn decode(data: &[u8]) -> Result<Self, BeaconError> {
        if data.len() != 19 && data.len() != 23 {
            return Err(BeaconError::TooShort(data.len()));
        }
        let device_uuid = Uuid::from_bytes(data[1..17].try_into().expect("16 bytes"));
        let oob_information = u16::from_be_bytes([data[17], data[18]]);
        let uri_hash = (data.len() == 23).then(|| data[19..23].try_into().expect("4 bytes"));
        Ok(Self {
            device_uuid,
            oob_information,
            uri_hash,
        })
    }
}

/// Secure Network Beacon.
///
/// ```text
/// type=0x01 ‖ flags(8) ‖ NetworkID(64) ‖ IVIndex(32) ‖ Auth(64)
/// ```
///
/// Flags: bit 0 key refresh in progress, bit 1 IV-Update active. The auth
/// value is the first 8 bytes of `AES-CMAC(BeaconKey, flags ‖ NetworkID ‖
/// IVIndex)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureNetworkBeacon {
    /// Key refresh flag.
    pub key_refresh: bool,
    /// IV-Update active flag.
    pub iv_update_active: bool,
    /// 64-bit Network ID of the authorizing key.
    pub network_id: [u8; 8],
    /// Announced IV-Index.
    pub iv_index: u32,
    /// Truncated CMAC authenticating the beacon.
    pub auth: [u8; 8],
}

impl SecureNetworkBeacon {
    /// Builds an authenticated beacon for the current network state.
    pub fn build(
        key_refresh: bool,
        iv: IvIndex,
        network_id: [u8; 8],
        beacon_key: &[u8; 16],
    ) -> Self {
        let mut beacon = Self {
            key_refresh,
            iv_update_active: iv.update_active,
            network_id,
            iv_index: iv.index,
            auth: [0u8; 8],
        };
        beacon.auth = beacon.compute_auth(beacon_key);
        beacon
    }

    /// The announced IV state as a pair.
    pub const fn iv(&self) -> IvIndex {
        IvIndex::new(self.iv_index, self.iv_update_active)
    }

    /// Encodes the beacon, type octet included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        out.push(BEACON_TYPE_SECURE_NETWORK);
        out.push(self.flags());
        out.extend_from_slice(&self.network_id);
        out.extend_from_slice(&self.iv_index.to_be_bytes());
        out.extend_from_slice(&self.auth);
        out
    }

    /// Decodes the beacon, type octet included.
    pub fn decode(data: &[u8]) -> Result<Self, BeaconError> {
        if data.len() != 22 {
            return Err(BeaconError::TooShort(data.len()));
        }
        Ok(Self {
            key_refresh: data[1] & 0x01 != 0,
            iv_update_active: data[1] & 0x02 != 0,
            network_id: data[2..10].try_into().expect("8 bytes"),
            iv_index: u32::from_be_bytes([data[10], data[11], data[12], data[13]]),
            auth: data[14..22].try_into().expect("8 bytes"),
        })
    }

    /// Verifies the auth value against a candidate beacon key.
    ///
    /// Constant-time comparison; a forged beacon must not leak which bytes
    /// matched.
    pub fn authenticate(&self, beacon_key: &[u8; 16]) -> bool {
        self.compute_auth(beacon_key).ct_eq(&self.auth).into()
    }

    fn flags(&self) -> u8 {
        (self.key_refresh as u8) | ((self.iv_update_active as u8) << 1)
    }

    fn compute_auth(&self, beacon_key: &[u8; 16]) -> [u8; 8] {
        let mut message = [0u8; 13];
        message[0] = self.flags();
        message[1..9].copy_from_slice(&self.network_id);
        message[9..13].copy_from_slice(&self.iv_index.to_be_bytes());
        let mac = aes_cmac(beacon_key, &message);
        mac[..8].try_into().expect("8-byte prefix")
    }
}

/// Computes the Node Identity hash a proxy advertises.
///
/// ```text
/// hash = e(IdentityKey, 0x000000000000 ‖ Random ‖ Address)[8..16]
/// ```
///
/// A client that knows the identity key recognizes a proxy node from its
/// advertised `(hash, random)` pair without the node revealing its address
/// to passive observers.
pub fn node_identity_hash(identity_key: &[u8; 16], random: &[u8; 8], address: Address) -> [u8; 8] {
    let mut block = [0u8; 16];
    block[6..14].copy_from_slice(random);
    block[14..16].copy_from_slice(&address.to_be_bytes());
    let out = aes_encrypt_block(identity_key, &block);
    out[8..16].try_into().expect("8-byte tail")
}
