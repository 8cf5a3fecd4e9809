//! Network, application and device keys with their derived quantities
//! (Mesh Profile §3.8.6).
//!
//! Every mutation of a master key recomputes the full derived set before
//! the key is published to the layers, so a key observed by the network
//! layer is always internally consistent.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{k1, k2, k3, k4, s1, KEY_SIZE};
use crate::time::Timestamp;

/// A 12-bit network or application key index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct KeyIndex(u16);

/// Error for key indices above the 12-bit range.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Key index {0} out of range (max 0xFFF)")]
pub struct KeyIndexOutOfRange(pub u16);

impl KeyIndex {
    /// Highest valid key index.
    pub const MAX: u16 = 0x0FFF;

    /// The primary network key index.
    pub const PRIMARY: KeyIndex = KeyIndex(0);

    /// The raw index value.
    pub const fn value(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for KeyIndex {
    type Error = KeyIndexOutOfRange;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value > Self::MAX {
            return Err(KeyIndexOutOfRange(value));
        }
        Ok(Self(value))
    }
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key refresh procedure phase (Mesh Profile §3.10.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    /// No refresh in progress; only the current key exists.
    #[default]
    NormalOperation,
    /// New key distributed; the node still transmits with the old key.
    DistributingKeys,
    /// All nodes hold the new key; transmit with it, old key revoked soon.
    Finalizing,
}

/// The full derived set for one 128-bit network master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKeyDerivatives {
    /// 7-bit NID selecting candidate keys on decode.
    pub nid: u8,
    /// Network-layer payload encryption key.
    pub encryption_key: [u8; KEY_SIZE],
    /// Network-header obfuscation key.
    pub privacy_key: [u8; KEY_SIZE],
    /// Secure Network Beacon authentication key.
    pub beacon_key: [u8; KEY_SIZE],
    /// Node Identity advertising key.
    pub identity_key: [u8; KEY_SIZE],
    /// 64-bit Network ID carried in beacons.
    pub network_id: [u8; 8],
}

impl NetworkKeyDerivatives {
    fn derive(key: &[u8; KEY_SIZE]) -> Self {
        let credentials = k2(key, &[0x00]);
        Self {
            nid: credentials.nid,
            encryption_key: credentials.encryption_key,
            privacy_key: credentials.privacy_key,
            beacon_key: k1(key, &s1(b"nkbk"), b"id128\x01"),
            identity_key: k1(key, &s1(b"nkik"), b"id128\x01"),
            network_id: k3(key),
        }
    }
}

/// A network key with refresh state and derived material.
#[derive(Debug, Clone)]
pub struct NetworkKey {
    index: KeyIndex,
    key: [u8; KEY_SIZE],
    old_key: Option<[u8; KEY_SIZE]>,
    phase: KeyRefreshPhase,
    phase_updated_at: Timestamp,
    derived: NetworkKeyDerivatives,
    old_derived: Option<NetworkKeyDerivatives>,
}

impl NetworkKey {
    /// Creates a key in normal operation.
    pub fn new(index: KeyIndex, key: [u8; KEY_SIZE]) -> Self {
        Self {
            index,
            key,
            old_key: None,
            phase: KeyRefreshPhase::NormalOperation,
            phase_updated_at: Timestamp::now(),
            derived: NetworkKeyDerivatives::derive(&key),
            old_derived: None,
        }
    }

    /// The key index.
    pub const fn index(&self) -> KeyIndex {
        self.index
    }

    /// The current master key bytes.
    pub const fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// The previous master key, while a refresh is in progress.
    pub const fn old_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.old_key.as_ref()
    }

    /// The refresh phase.
    pub const fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// When the phase last changed.
    pub const fn phase_updated_at(&self) -> Timestamp {
        self.phase_updated_at
    }

    /// Derived material for the current key.
    pub const fn derived(&self) -> &NetworkKeyDerivatives {
        &self.derived
    }

    /// Derived material for the old key, while a refresh is in progress.
    pub const fn old_derived(&self) -> Option<&NetworkKeyDerivatives> {
        self.old_derived.as_ref()
    }

    /// Begins a key refresh: installs `new_key` and enters
    /// `DistributingKeys`, keeping the old key for transmission.
    pub fn update_key(&mut self, new_key: [u8; KEY_SIZE], now: Timestamp) {
        self.old_key = Some(self.key);
        self.old_derived = Some(self.derived);
        self.key = new_key;
        self.derived = NetworkKeyDerivatives::derive(&new_key);
        self.phase = KeyRefreshPhase::DistributingKeys;
        self.phase_updated_at = now;
    }

    /// Moves to `Finalizing`: the node starts transmitting with the new
    /// key while still accepting the old one.
    pub fn finalize_refresh(&mut self, now: Timestamp) {
        if self.phase == KeyRefreshPhase::DistributingKeys {
            self.phase = KeyRefreshPhase::Finalizing;
            self.phase_updated_at = now;
        }
    }

    /// Revokes the old key and returns to normal operation.
    pub fn revoke_old_key(&mut self, now: Timestamp) {
        if self.old_key.is_some() {
            self.old_key = None;
            self.old_derived = None;
            self.phase = KeyRefreshPhase::NormalOperation;
            self.phase_updated_at = now;
        }
    }

    /// The derived set used for outbound PDUs.
    ///
    /// During `DistributingKeys` the node transmits with the old keys;
    /// from `Finalizing` onwards with the new ones.
    pub fn transmit_keys(&self) -> &NetworkKeyDerivatives {
        match (self.phase, self.old_derived.as_ref()) {
            (KeyRefreshPhase::DistributingKeys, Some(old)) => old,
            _ => &self.derived,
        }
    }

    /// All derived sets valid for inbound PDUs, current first.
    pub fn receive_keys(&self) -> impl Iterator<Item = &NetworkKeyDerivatives> {
        std::iter::once(&self.derived).chain(self.old_derived.as_ref())
    }

    /// True if either the current or old NID matches.
    pub fn matches_nid(&self, nid: u8) -> bool {
        self.receive_keys().any(|d| d.nid == nid)
    }

    /// True if either the current or old Network ID matches.
    pub fn matches_network_id(&self, network_id: &[u8; 8]) -> bool {
        self.receive_keys().any(|d| &d.network_id == network_id)
    }
}

/// An application key bound to one network key.
#[derive(Debug, Clone)]
pub struct ApplicationKey {
    index: KeyIndex,
    key: [u8; KEY_SIZE],
    aid: u8,
    old_key: Option<[u8; KEY_SIZE]>,
    old_aid: Option<u8>,
    bound_network_key: KeyIndex,
}

impl ApplicationKey {
    /// Creates an application key bound to `bound_network_key`.
    pub fn new(index: KeyIndex, key: [u8; KEY_SIZE], bound_network_key: KeyIndex) -> Self {
        Self {
            index,
            key,
            aid: k4(&key),
            old_key: None,
            old_aid: None,
            bound_network_key,
        }
    }

    /// The key index.
    pub const fn index(&self) -> KeyIndex {
        self.index
    }

    /// The current key bytes.
    pub const fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// The 6-bit AID of the current key.
    pub const fn aid(&self) -> u8 {
        self.aid
    }

    /// The index of the network key this key is bound to.
    pub const fn bound_network_key(&self) -> KeyIndex {
        self.bound_network_key
    }

    /// Installs a refreshed key, keeping the old one for decryption.
    pub fn update_key(&mut self, new_key: [u8; KEY_SIZE]) {
        self.old_key = Some(self.key);
        self.old_aid = Some(self.aid);
        self.key = new_key;
        self.aid = k4(&new_key);
    }

    /// Drops the old key once the bound network key finishes refresh.
    pub fn revoke_old_key(&mut self) {
        self.old_key = None;
        self.old_aid = None;
    }

    /// The key and AID used for outbound messages, given the refresh phase
    /// of the bound network key.
    ///
    /// Mirrors the network-layer rule: while keys are being distributed
    /// the node still transmits with the old key.
    pub fn transmit_key(&self, phase: KeyRefreshPhase) -> (&[u8; KEY_SIZE], u8) {
        match (phase, self.old_key.as_ref(), self.old_aid) {
            (KeyRefreshPhase::DistributingKeys, Some(old_key), Some(old_aid)) => (old_key, old_aid),
            _ => (&self.key, self.aid),
        }
    }

    /// Key candidates whose AID matches, current first.
    pub fn keys_matching_aid(&self, aid: u8) -> impl Iterator<Item = &[u8; KEY_SIZE]> {
        let current = (self.aid == aid).then_some(&self.key);
        let old = match (self.old_aid, self.old_key.as_ref()) {
            (Some(old_aid), Some(old_key)) if old_aid == aid => Some(old_key),
            _ => None,
        };
        current.into_iter().chain(old)
    }
}

/// A node's device key, known only to the node and its provisioner.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey(pub [u8; KEY_SIZE]);

impl DeviceKey {
    /// The key bytes.
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Device keys never reach logs.
        write!(f, "DeviceKey(..)")
    }
}

impl From<[u8; KEY_SIZE]> for DeviceKey {
    fn from(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> [u8; 16] {
        hex::decode("7dd7364cd842ad18c17c2b820c84c3d6")
            .unwrap()
            .try_into()
            .unwrap()
    }

    /// Mesh Profile §8.1.5/§8.2.2 sample data.
    #[test]
    fn test_network_key_derivatives() {
        let key = NetworkKey::new(KeyIndex::PRIMARY, sample_key());
        let derived = key.derived();
        assert_eq!(derived.nid, 0x68);
        assert_eq!(
            hex::encode(derived.encryption_key),
            "0953fa93e7caac9638f58820220a398e"
        );
        assert_eq!(
            hex::encode(derived.privacy_key),
            "8b84eedec100067d670971dd2aa700cf"
        );
        assert_eq!(hex::encode(derived.network_id), "3ecaff672f673370");
    }

    #[test]
    fn test_transmit_keys_follow_phase() {
        let now = Timestamp::new(0);
        let mut key = NetworkKey::new(KeyIndex::PRIMARY, sample_key());
        let old_nid = key.derived().nid;

        key.update_key([0xA5; 16], now);
        assert_eq!(key.phase(), KeyRefreshPhase::DistributingKeys);
        // Still transmitting with the old key.
        assert_eq!(key.transmit_keys().nid, old_nid);
        // Both keys accepted inbound.
        assert_eq!(key.receive_keys().count(), 2);

        key.finalize_refresh(now);
        assert_eq!(key.transmit_keys().nid, key.derived().nid);
        assert_eq!(key.receive_keys().count(), 2);

        key.revoke_old_key(now);
        assert_eq!(key.phase(), KeyRefreshPhase::NormalOperation);
        assert_eq!(key.receive_keys().count(), 1);
    }

    #[test]
    fn test_application_key_aid_candidates() {
        let mut app = ApplicationKey::new(
            KeyIndex::try_from(1).unwrap(),
            [0x11; 16],
            KeyIndex::PRIMARY,
        );
        let first_aid = app.aid();
        assert!(first_aid < 64);
        assert_eq!(app.keys_matching_aid(first_aid).count(), 1);

        app.update_key([0x22; 16]);
        // Old key still answers to its AID during refresh.
        assert!(app.keys_matching_aid(first_aid).any(|k| k == &[0x11; 16]));
        app.revoke_old_key();
        assert!(!app.keys_matching_aid(first_aid).any(|k| k == &[0x11; 16]));
    }

    #[test]
    fn test_key_index_range() {
        assert!(KeyIndex::try_from(0x0FFF).is_ok());
        assert_eq!(KeyIndex::try_from(0x1000), Err(KeyIndexOutOfRange(0x1000)));
    }
}
