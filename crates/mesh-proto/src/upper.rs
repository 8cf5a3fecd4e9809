//! Upper-transport access-payload encryption (Mesh Profile §3.6.2, §3.8.5).
//!
//! The access payload is CCM-encrypted with an application or device key.
//! The 13-byte nonce carries the sequence number of the first network PDU
//! the message rides on, the endpoints and the IV-Index; virtual
//! destinations add their label UUID as additional authenticated data.

use mesh_core::crypto::{ccm_decrypt, ccm_encrypt, CcmError, MicSize, NONCE_SIZE};
use mesh_core::{Address, MeshAddress, SEQUENCE_LIMIT};
use thiserror::Error;
use uuid::Uuid;

use crate::lower::{ACCESS_SEGMENT_SIZE, MAX_SEGMENTS, UNSEGMENTED_ACCESS_MAX};

/// Longest access payload: 32 segments of 12 bytes minus the 32-bit MIC.
pub const MAX_ACCESS_PAYLOAD: usize = MAX_SEGMENTS * ACCESS_SEGMENT_SIZE - MicSize::Mic32.len();

/// Errors from upper-transport sealing and opening.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpperPduError {
    /// Payload cannot fit 32 segments
    #[error("Access payload of {0} bytes exceeds the transport limit")]
    PayloadTooLong(usize),

    /// Empty payload
    #[error("Access payload is empty")]
    PayloadEmpty,

    /// Sequence number does not fit 24 bits
    #[error("Sequence number 0x{0:X} out of range")]
    InvalidSequence(u32),

    /// CCM rejected the PDU; treated as a silent drop by callers
    #[error(transparent)]
    Crypto(#[from] CcmError),
}

/// The key encrypting an access payload.
#[derive(Debug, Clone, Copy)]
pub enum AccessKey<'a> {
    /// An application key (nonce type `0x01`).
    Application(&'a [u8; 16]),
    /// A node's device key (nonce type `0x02`).
    Device(&'a [u8; 16]),
}

impl AccessKey<'_> {
    const fn nonce_type(&self) -> u8 {
        match self {
            AccessKey::Application(_) => 0x01,
            AccessKey::Device(_) => 0x02,
        }
    }

    const fn key(&self) -> &[u8; 16] {
        match self {
            AccessKey::Application(key) => key,
            AccessKey::Device(key) => key,
        }
    }
}

/// How an access message maps onto lower-transport PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLayout {
    /// True when the message needs segmentation.
    pub segmented: bool,
    /// MIC size flag: true selects the 64-bit MIC.
    pub szmic: bool,
    /// Number of segments (1 for unsegmented).
    pub segment_count: u8,
}

/// Plans segmentation and MIC size for a payload.
///
/// Unsegmented messages always use the 32-bit MIC. Segmented messages
/// upgrade to the 64-bit MIC exactly when doing so does not add a segment.
pub fn plan_access_message(payload_len: usize) -> Result<TransportLayout, UpperPduError> {
    if payload_len == 0 {
        return Err(UpperPduError::PayloadEmpty);
    }
    if payload_len + MicSize::Mic32.len() <= UNSEGMENTED_ACCESS_MAX {
        return Ok(TransportLayout {
            segmented: false,
            szmic: false,
            segment_count: 1,
        });
    }
    let with_short = (payload_len + MicSize::Mic32.len()).div_ceil(ACCESS_SEGMENT_SIZE);
    if with_short > MAX_SEGMENTS {
        return Err(UpperPduError::PayloadTooLong(payload_len));
    }
    let with_long = (payload_len + MicSize::Mic64.len()).div_ceil(ACCESS_SEGMENT_SIZE);
    Ok(TransportLayout {
        segmented: true,
        szmic: with_long == with_short,
        segment_count: with_short as u8,
    })
}

/// Encrypts an access payload, returning ciphertext ‖ TransMIC.
///
/// `seq` is the sequence number the first network PDU will carry; for a
/// segmented message every segment authenticates against this value via
/// SeqZero.
pub fn seal_access_payload(
    key: AccessKey<'_>,
    szmic: bool,
    seq: u32,
    src: Address,
    dst: &MeshAddress,
    iv_index: u32,
    payload: &[u8],
) -> Result<Vec<u8>, UpperPduError> {
    if payload.is_empty() {
        return Err(UpperPduError::PayloadEmpty);
    }
    if payload.len() > MAX_ACCESS_PAYLOAD {
        return Err(UpperPduError::PayloadTooLong(payload.len()));
    }
    if seq >= SEQUENCE_LIMIT {
        return Err(UpperPduError::InvalidSequence(seq));
    }
    let nonce = access_nonce(key.nonce_type(), szmic, seq, src, dst.address(), iv_index);
    let aad = label_aad(dst.label());
    let mic = if szmic { MicSize::Mic64 } else { MicSize::Mic32 };
    Ok(ccm_encrypt(key.key(), &nonce, payload, aad, mic)?)
}

/// Verifies and decrypts ciphertext ‖ TransMIC.
///
/// `seq` is the SeqAuth-reconstructed sequence number of the first
/// segment; `label` must be the subscribed label UUID when the
/// destination is virtual.
pub fn open_access_payload(
    key: AccessKey<'_>,
    szmic: bool,
    seq: u32,
    src: Address,
    dst: Address,
    label: Option<&Uuid>,
    iv_index: u32,
    data: &[u8],
) -> Result<Vec<u8>, UpperPduError> {
    let nonce = access_nonce(key.nonce_type(), szmic, seq, src, dst, iv_index);
    let aad = label_aad(label);
    let mic = if szmic { MicSize::Mic64 } else { MicSize::Mic32 };
    Ok(ccm_decrypt(key.key(), &nonce, data, aad, mic)?)
}

/// Builds the application or device nonce.
///
/// ```text
/// type(8) ‖ ASZMIC(1) pad(7) ‖ SEQ(24) ‖ SRC(16) ‖ DST(16) ‖ IVIndex(32)
/// ```
fn access_nonce(
    nonce_type: u8,
    szmic: bool,
    seq: u32,
    src: Address,
    dst: Address,
    iv_index: u32,
) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = nonce_type;
    nonce[1] = (szmic as u8) << 7;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[7..9].copy_from_slice(&dst.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

fn label_aad(label: Option<&Uuid>) -> &[u8] {
    label.map(|uuid| uuid.as_bytes().as_slice()).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x63; 16];

    #[test]
    fn test_plan_unsegmented() {
        let plan = plan_access_message(11).unwrap();
        assert_eq!(
            plan,
            TransportLayout {
                segmented: false,
                szmic: false,
                segment_count: 1
            }
        );
    }

    #[test]
    fn test_plan_segmented_short_mic() {
        // 20 + 4 = 24 bytes → exactly 2 segments; 20 + 8 = 28 → 3, so the
        // long MIC would cost a segment and the short one is kept.
        let plan = plan_access_message(20).unwrap();
        assert_eq!(
            plan,
            TransportLayout {
                segmented: true,
                szmic: false,
                segment_count: 2
            }
        );
    }

    #[test]
    fn test_plan_segmented_long_mic_fits() {
        // 16 + 4 = 20 → 2 segments; 16 + 8 = 24 → still 2, so the long MIC
        // is free and gets chosen.
        let plan = plan_access_message(16).unwrap();
        assert_eq!(
            plan,
            TransportLayout {
                segmented: true,
                szmic: true,
                segment_count: 2
            }
        );
    }

    #[test]
    fn test_plan_limits() {
        let plan = plan_access_message(MAX_ACCESS_PAYLOAD).unwrap();
        assert_eq!(plan.segment_count, 32);
        assert!(!plan.szmic);
        assert!(matches!(
            plan_access_message(MAX_ACCESS_PAYLOAD + 1),
            Err(UpperPduError::PayloadTooLong(_))
        ));
        assert!(matches!(
            plan_access_message(0),
            Err(UpperPduError::PayloadEmpty)
        ));
    }

    #[test]
    fn test_roundtrip_application_key() {
        let dst = MeshAddress::new(Address(0x1201));
        let sealed = seal_access_payload(
            AccessKey::Application(&KEY),
            false,
            0x000007,
            Address(0x0003),
            &dst,
            0x12345678,
            b"off",
        )
        .unwrap();
        assert_eq!(sealed.len(), 3 + 4);

        let opened = open_access_payload(
            AccessKey::Application(&KEY),
            false,
            0x000007,
            Address(0x0003),
            dst.address(),
            None,
            0x12345678,
            &sealed,
        )
        .unwrap();
        assert_eq!(opened, b"off");
    }

    #[test]
    fn test_device_key_nonce_differs() {
        let dst = MeshAddress::new(Address(0x1201));
        let app = seal_access_payload(
            AccessKey::Application(&KEY),
            false,
            1,
            Address(0x0003),
            &dst,
            0,
            b"state",
        )
        .unwrap();
        let dev = seal_access_payload(
            AccessKey::Device(&KEY),
            false,
            1,
            Address(0x0003),
            &dst,
            0,
            b"state",
        )
        .unwrap();
        assert_ne!(app, dev);

        // Opening with the wrong nonce type fails authentication.
        let result = open_access_payload(
            AccessKey::Device(&KEY),
            false,
            1,
            Address(0x0003),
            dst.address(),
            None,
            0,
            &app,
        );
        assert!(matches!(result, Err(UpperPduError::Crypto(_))));
    }

    #[test]
    fn test_virtual_label_is_authenticated() {
        let label = Uuid::from_bytes([0x9A; 16]);
        let dst = MeshAddress::with_label(label);

        let sealed = seal_access_payload(
            AccessKey::Application(&KEY),
            false,
            2,
            Address(0x0003),
            &dst,
            0,
            b"lvl",
        )
        .unwrap();

        let opened = open_access_payload(
            AccessKey::Application(&KEY),
            false,
            2,
            Address(0x0003),
            dst.address(),
            Some(&label),
            0,
            &sealed,
        )
        .unwrap();
        assert_eq!(opened, b"lvl");

        // A receiver without the label, or with a different one, rejects.
        let wrong = Uuid::from_bytes([0x9B; 16]);
        assert!(open_access_payload(
            AccessKey::Application(&KEY),
            false,
            2,
            Address(0x0003),
            dst.address(),
            Some(&wrong),
            0,
            &sealed,
        )
        .is_err());
        assert!(open_access_payload(
            AccessKey::Application(&KEY),
            false,
            2,
            Address(0x0003),
            dst.address(),
            None,
            0,
            &sealed,
        )
        .is_err());
    }

    #[test]
    fn test_szmic_roundtrip() {
        let dst = MeshAddress::new(Address(0xC105));
        let payload = vec![0x31; 16];
        let sealed = seal_access_payload(
            AccessKey::Application(&KEY),
            true,
            5,
            Address(0x0003),
            &dst,
            0,
            &payload,
        )
        .unwrap();
        assert_eq!(sealed.len(), payload.len() + 8);

        let opened = open_access_payload(
            AccessKey::Application(&KEY),
            true,
            5,
            Address(0x0003),
            dst.address(),
            None,
            0,
            &sealed,
        )
        .unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_random_payload_sizes() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        for _ in 0..32 {
            let len = rng.gen_range(1..=MAX_ACCESS_PAYLOAD);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let plan = plan_access_message(len).unwrap();
            let dst = MeshAddress::new(Address(0x0042));

            let sealed = seal_access_payload(
                AccessKey::Application(&KEY),
                plan.szmic,
                0x101010,
                Address(0x0001),
                &dst,
                7,
                &payload,
            )
            .unwrap();
            let opened = open_access_payload(
                AccessKey::Application(&KEY),
                plan.szmic,
                0x101010,
                Address(0x0001),
                dst.address(),
                None,
                7,
                &sealed,
            )
            .unwrap();
            assert_eq!(opened, payload);
        }
    }
}
