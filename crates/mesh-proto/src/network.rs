//! Network PDU sealing and opening (Mesh Profile §3.4.4, §3.8.7).
//!
//! On-air layout:
//!
//! ```text
//! IVI(1) ‖ NID(7) ‖ CTL(1) ‖ TTL(7) ‖ SEQ(24) ‖ SRC(16) ‖ DST(16) ‖ TransportPDU ‖ NetMIC
//! ```
//!
//! `DST ‖ TransportPDU` is CCM-encrypted under the encryption key with the
//! network (or proxy) nonce; the NetMIC is 32-bit for access PDUs and
//! 64-bit for control PDUs. The header bytes `CTL|TTL ‖ SEQ ‖ SRC` are then
//! obfuscated by XOR with the privacy counter block so that passive
//! observers cannot correlate traffic by source.

use mesh_core::crypto::{
    aes_encrypt_block, ccm_decrypt, ccm_encrypt, CcmError, MicSize, NONCE_SIZE,
};
use mesh_core::{Address, NetworkKeyDerivatives, MAX_TTL, SEQUENCE_LIMIT};
use thiserror::Error;

/// Maximum transport payload of an access network PDU on the advertising
/// bearer (29-byte PDU minus 9 header bytes and the 32-bit MIC).
pub const MAX_ACCESS_TRANSPORT_PDU: usize = 16;

/// Maximum transport payload of a control network PDU (64-bit MIC).
pub const MAX_CONTROL_TRANSPORT_PDU: usize = 12;

/// Errors from network PDU sealing and opening.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkPduError {
    /// TTL above 127
    #[error("TTL {0} out of range")]
    InvalidTtl(u8),

    /// Sequence number does not fit 24 bits
    #[error("Sequence number 0x{0:X} out of range")]
    InvalidSequence(u32),

    /// Source is not a unicast address
    #[error("Source {0} is not unicast")]
    InvalidSource(Address),

    /// Transport payload empty or above the bearer limit
    #[error("Transport PDU length {0} invalid")]
    InvalidTransportLength(usize),

    /// PDU shorter than the minimal envelope
    #[error("PDU too short: {0} bytes")]
    TooShort(usize),

    /// The NID does not match the candidate key
    #[error("NID mismatch")]
    NidMismatch,

    /// CCM rejected the PDU; treated as a silent drop by callers
    #[error(transparent)]
    Crypto(#[from] CcmError),
}

/// Which nonce the PDU is sealed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkNonce {
    /// The network nonce (type `0x00`); regular mesh traffic.
    Network,
    /// The proxy nonce (type `0x03`); proxy configuration messages, which
    /// travel only over the GATT bearer and are not bounded by the
    /// advertising PDU size.
    Proxy,
}

/// A network PDU in the clear, before sealing or after opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Control flag: selects the 64-bit NetMIC and a control transport PDU.
    pub ctl: bool,
    /// Time to live, 0..=127.
    pub ttl: u8,
    /// 24-bit sequence number.
    pub seq: u32,
    /// Source unicast address.
    pub src: Address,
    /// Destination address.
    pub dst: Address,
    /// Lower-transport payload.
    pub transport_pdu: Vec<u8>,
}

impl NetworkPdu {
    /// Seals the PDU for the air under one set of network credentials.
    pub fn seal(
        &self,
        keys: &NetworkKeyDerivatives,
        iv_index: u32,
        nonce: NetworkNonce,
    ) -> Result<Vec<u8>, NetworkPduError> {
        if self.ttl > MAX_TTL {
            return Err(NetworkPduError::InvalidTtl(self.ttl));
        }
        if self.seq >= SEQUENCE_LIMIT {
            return Err(NetworkPduError::InvalidSequence(self.seq));
        }
        if !self.src.is_unicast() {
            return Err(NetworkPduError::InvalidSource(self.src));
        }
        let max = match (nonce, self.ctl) {
            // Proxy configuration rides on GATT; the MTU governs there.
            (NetworkNonce::Proxy, _) => usize::MAX,
            (NetworkNonce::Network, true) => MAX_CONTROL_TRANSPORT_PDU,
            (NetworkNonce::Network, false) => MAX_ACCESS_TRANSPORT_PDU,
        };
        if self.transport_pdu.is_empty() || self.transport_pdu.len() > max {
            return Err(NetworkPduError::InvalidTransportLength(
                self.transport_pdu.len(),
            ));
        }

        let mic = if self.ctl {
            MicSize::Mic64
        } else {
            MicSize::Mic32
        };
        let nonce_bytes = self.build_nonce(nonce, iv_index);

        let mut plaintext = Vec::with_capacity(2 + self.transport_pdu.len());
        plaintext.extend_from_slice(&self.dst.to_be_bytes());
        plaintext.extend_from_slice(&self.transport_pdu);
        let ciphertext = ccm_encrypt(&keys.encryption_key, &nonce_bytes, &plaintext, &[], mic)?;

        let mut pdu = Vec::with_capacity(7 + ciphertext.len());
        pdu.push(((iv_index as u8 & 1) << 7) | keys.nid);
        pdu.push(((self.ctl as u8) << 7) | self.ttl);
        pdu.extend_from_slice(&self.seq.to_be_bytes()[1..]);
        pdu.extend_from_slice(&self.src.to_be_bytes());
        pdu.extend_from_slice(&ciphertext);

        obfuscate(&mut pdu, &keys.privacy_key, iv_index);
        Ok(pdu)
    }

    /// Opens a received PDU with one candidate key and a resolved IV-Index.
    ///
    /// The caller picks candidates by NID and resolves the IVI bit to a
    /// full index before calling; a MIC failure here means this candidate
    /// was not the sender's key and the next one is tried.
    pub fn open(
        data: &[u8],
        keys: &NetworkKeyDerivatives,
        iv_index: u32,
        nonce: NetworkNonce,
    ) -> Result<NetworkPdu, NetworkPduError> {
        // 7 header bytes, then at least DST(2) + one transport byte + MIC(4).
        if data.len() < 14 {
            return Err(NetworkPduError::TooShort(data.len()));
        }
        if data[0] & 0x7F != keys.nid {
            return Err(NetworkPduError::NidMismatch);
        }

        let mut header = [0u8; 6];
        header.copy_from_slice(&data[1..7]);
        let pecb = privacy_counter_block(&keys.privacy_key, iv_index, &data[7..14]);
        for (byte, mask) in header.iter_mut().zip(&pecb) {
            *byte ^= mask;
        }

        let ctl = header[0] & 0x80 != 0;
        let ttl = header[0] & 0x7F;
        let seq = u32::from_be_bytes([0, header[1], header[2], header[3]]);
        let src = Address::from_be_bytes([header[4], header[5]]);
        if !src.is_unicast() {
            return Err(NetworkPduError::InvalidSource(src));
        }

        let mic = if ctl { MicSize::Mic64 } else { MicSize::Mic32 };
        if data.len() < 7 + 2 + 1 + mic.len() {
            return Err(NetworkPduError::TooShort(data.len()));
        }

        let pdu = NetworkPdu {
            ctl,
            ttl,
            seq,
            src,
            dst: Address::UNASSIGNED,
            transport_pdu: Vec::new(),
        };
        let nonce_bytes = pdu.build_nonce(nonce, iv_index);
        let plaintext = ccm_decrypt(&keys.encryption_key, &nonce_bytes, &data[7..], &[], mic)?;

        Ok(NetworkPdu {
            dst: Address::from_be_bytes([plaintext[0], plaintext[1]]),
            transport_pdu: plaintext[2..].to_vec(),
            ..pdu
        })
    }

    fn build_nonce(&self, kind: NetworkNonce, iv_index: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        match kind {
            NetworkNonce::Network => {
                nonce[0] = 0x00;
                nonce[1] = ((self.ctl as u8) << 7) | self.ttl;
            }
            NetworkNonce::Proxy => {
                nonce[0] = 0x03;
                nonce[1] = 0x00;
            }
        }
        nonce[2..5].copy_from_slice(&self.seq.to_be_bytes()[1..]);
        nonce[5..7].copy_from_slice(&self.src.to_be_bytes());
        // Bytes 7..9 are zero padding.
        nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
        nonce
    }
}

/// Computes the privacy counter block for header (de)obfuscation.
///
/// ```text
/// PECB = e(PrivacyKey, 0x0000000000 ‖ IVIndex ‖ PrivacyRandom)
/// ```
///
/// where the privacy random is the first 7 bytes of the encrypted
/// `DST ‖ TransportPDU ‖ NetMIC`.
fn privacy_counter_block(privacy_key: &[u8; 16], iv_index: u32, random: &[u8]) -> [u8; 6] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(&random[..7]);
    let pecb = aes_encrypt_block(privacy_key, &block);
    pecb[..6].try_into().expect("6-byte prefix")
}

fn obfuscate(pdu: &mut [u8], privacy_key: &[u8; 16], iv_index: u32) {
    let random: [u8; 7] = pdu[7..14].try_into().expect("sealed PDU carries >= 7 cipher bytes");
    let pecb = privacy_counter_block(privacy_key, iv_index, &random);
    for (byte, mask) in pdu[1..7].iter_mut().zip(&pecb) {
        *byte ^= mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{KeyIndex, NetworkKey};

    fn sample_keys() -> NetworkKey {
        let key: [u8; 16] = hex::decode("7dd7364cd842ad18c17c2b820c84c3d6")
            .unwrap()
            .try_into()
            .unwrap();
        NetworkKey::new(KeyIndex::PRIMARY, key)
    }

    /// Mesh Profile §8.3 sample data: control PDU over the sample network
    /// key at IV-Index 0x12345678.
    #[test]
    fn test_seal_matches_sample_vector() {
        let keys = sample_keys();
        let pdu = NetworkPdu {
            ctl: true,
            ttl: 0,
            seq: 0x000006,
            src: Address(0x1201),
            dst: Address(0xFFFD),
            transport_pdu: hex::decode("034b50057e400000010000").unwrap(),
        };

        let sealed = pdu
            .seal(keys.derived(), 0x12345678, NetworkNonce::Network)
            .unwrap();
        assert_eq!(
            hex::encode(&sealed),
            "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df"
        );
    }

    #[test]
    fn test_roundtrip_access() {
        let keys = sample_keys();
        let pdu = NetworkPdu {
            ctl: false,
            ttl: 4,
            seq: 0x3129AB,
            src: Address(0x0003),
            dst: Address(0x1201),
            transport_pdu: vec![0x00, 0x56, 0x34, 0x12, 0x63, 0x96, 0x47, 0x71],
        };

        let sealed = pdu
            .seal(keys.derived(), 0x12345678, NetworkNonce::Network)
            .unwrap();
        let opened =
            NetworkPdu::open(&sealed, keys.derived(), 0x12345678, NetworkNonce::Network).unwrap();
        assert_eq!(opened, pdu);
    }

    #[test]
    fn test_roundtrip_randomized() {
        use rand::Rng;
        let keys = sample_keys();
        let mut rng = rand::thread_rng();

        for _ in 0..64 {
            let ctl: bool = rng.gen();
            let max = if ctl {
                MAX_CONTROL_TRANSPORT_PDU
            } else {
                MAX_ACCESS_TRANSPORT_PDU
            };
            let len = rng.gen_range(1..=max);
            let pdu = NetworkPdu {
                ctl,
                ttl: rng.gen_range(0..=127),
                seq: rng.gen_range(0..SEQUENCE_LIMIT),
                src: Address(rng.gen_range(1..=0x7FFF)),
                dst: Address(rng.gen()),
                transport_pdu: (0..len).map(|_| rng.gen()).collect(),
            };
            let iv_index: u32 = rng.gen();

            let sealed = pdu.seal(keys.derived(), iv_index, NetworkNonce::Network).unwrap();
            let opened =
                NetworkPdu::open(&sealed, keys.derived(), iv_index, NetworkNonce::Network).unwrap();
            assert_eq!(opened, pdu);
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let keys = sample_keys();
        let other = NetworkKey::new(KeyIndex::PRIMARY, [0x55; 16]);
        let pdu = NetworkPdu {
            ctl: false,
            ttl: 1,
            seq: 1,
            src: Address(0x0001),
            dst: Address(0x0002),
            transport_pdu: vec![0x01, 0x02, 0x03],
        };

        let sealed = pdu.seal(keys.derived(), 0, NetworkNonce::Network).unwrap();
        // With a different NID the candidate is screened out early; force
        // the same NID path by checking for either error.
        let result = NetworkPdu::open(&sealed, other.derived(), 0, NetworkNonce::Network);
        assert!(matches!(
            result,
            Err(NetworkPduError::NidMismatch | NetworkPduError::Crypto(CcmError::MicMismatch))
        ));
    }

    #[test]
    fn test_wrong_iv_index_rejected() {
        let keys = sample_keys();
        let pdu = NetworkPdu {
            ctl: false,
            ttl: 1,
            seq: 1,
            src: Address(0x0001),
            dst: Address(0x0002),
            transport_pdu: vec![0x01, 0x02, 0x03],
        };

        let sealed = pdu.seal(keys.derived(), 0x10, NetworkNonce::Network).unwrap();
        let result = NetworkPdu::open(&sealed, keys.derived(), 0x12, NetworkNonce::Network);
        assert!(matches!(result, Err(NetworkPduError::Crypto(_))));
    }

    #[test]
    fn test_proxy_nonce_differs() {
        let keys = sample_keys();
        let pdu = NetworkPdu {
            ctl: true,
            ttl: 0,
            seq: 7,
            src: Address(0x0001),
            dst: Address::UNASSIGNED,
            transport_pdu: vec![0x00, 0x01],
        };

        let network = pdu.seal(keys.derived(), 0, NetworkNonce::Network).unwrap();
        let proxy = pdu.seal(keys.derived(), 0, NetworkNonce::Proxy).unwrap();
        assert_ne!(network, proxy);

        let opened = NetworkPdu::open(&proxy, keys.derived(), 0, NetworkNonce::Proxy).unwrap();
        assert_eq!(opened, pdu);
    }

    #[test]
    fn test_seal_validation() {
        let keys = sample_keys();
        let base = NetworkPdu {
            ctl: false,
            ttl: 1,
            seq: 1,
            src: Address(0x0001),
            dst: Address(0x0002),
            transport_pdu: vec![0x00],
        };

        let bad_ttl = NetworkPdu { ttl: 128, ..base.clone() };
        assert_eq!(
            bad_ttl.seal(keys.derived(), 0, NetworkNonce::Network),
            Err(NetworkPduError::InvalidTtl(128))
        );

        let bad_src = NetworkPdu { src: Address(0x8001), ..base.clone() };
        assert!(matches!(
            bad_src.seal(keys.derived(), 0, NetworkNonce::Network),
            Err(NetworkPduError::InvalidSource(_))
        ));

        let too_long = NetworkPdu {
            transport_pdu: vec![0; MAX_ACCESS_TRANSPORT_PDU + 1],
            ..base
        };
        assert!(matches!(
            too_long.seal(keys.derived(), 0, NetworkNonce::Network),
            Err(NetworkPduError::InvalidTransportLength(_))
        ));
    }

    #[test]
    fn test_short_pdu_rejected() {
        let keys = sample_keys();
        assert!(matches!(
            NetworkPdu::open(&[0x68; 10], keys.derived(), 0, NetworkNonce::Network),
            Err(NetworkPduError::TooShort(10))
        ));
    }
}
