//! AES-CCM authenticated encryption (Mesh Profile §3.8.2).
//!
//! The profile uses CCM with a 13-byte nonce and either a 32-bit MIC
//! (access messages, short transport MIC) or a 64-bit MIC (control
//! messages, long transport MIC, provisioning data).

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use thiserror::Error;

use super::{KEY_SIZE, NONCE_SIZE};

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// MIC length selector for CCM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicSize {
    /// 32-bit MIC (access payloads, short transport MIC).
    Mic32,
    /// 64-bit MIC (control payloads, long transport MIC).
    Mic64,
}

impl MicSize {
    /// MIC length in bytes.
    pub const fn len(&self) -> usize {
        match self {
            MicSize::Mic32 => 4,
            MicSize::Mic64 => 8,
        }
    }
}

/// Errors from CCM operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CcmError {
    /// Plaintext too long for the CCM length field
    #[error("Plaintext too long for CCM")]
    PlaintextTooLong,

    /// Ciphertext shorter than the MIC
    #[error("Ciphertext too short: expected at least {0} bytes")]
    CiphertextTooShort(usize),

    /// Authentication failed. Callers drop the PDU without logging above
    /// debug level; a failed MIC on the air is routine.
    #[error("MIC verification failed")]
    MicMismatch,
}

/// Encrypts and authenticates `plaintext`, returning ciphertext ‖ MIC.
///
/// # Arguments
/// * `key` - 16-byte encryption key
/// * `nonce` - 13-byte nonce (unique per key and message)
/// * `plaintext` - data to encrypt
/// * `aad` - additional authenticated data (the virtual label UUID, or empty)
/// * `mic` - MIC length to append
pub fn ccm_encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CcmError> {
    let nonce = GenericArray::from_slice(nonce);
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let result = match mic {
        MicSize::Mic32 => Ccm32::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
        MicSize::Mic64 => Ccm64::new(GenericArray::from_slice(key)).encrypt(nonce, payload),
    };
    result.map_err(|_| CcmError::PlaintextTooLong)
}

/// Verifies and decrypts ciphertext ‖ MIC produced by [`ccm_encrypt`].
///
/// Returns [`CcmError::MicMismatch`] when authentication fails; the caller
/// treats that as a silent drop.
pub fn ccm_decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CcmError> {
    if ciphertext.len() < mic.len() {
        return Err(CcmError::CiphertextTooShort(mic.len()));
    }
    let nonce = GenericArray::from_slice(nonce);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let result = match mic {
        MicSize::Mic32 => Ccm32::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
        MicSize::Mic64 => Ccm64::new(GenericArray::from_slice(key)).decrypt(nonce, payload),
    };
    result.map_err(|_| CcmError::MicMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_mic32() {
        let key = [0x42u8; 16];
        let nonce = [0x01u8; 13];
        let plaintext = b"access payload";

        let sealed = ccm_encrypt(&key, &nonce, plaintext, &[], MicSize::Mic32).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + 4);

        let opened = ccm_decrypt(&key, &nonce, &sealed, &[], MicSize::Mic32).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_roundtrip_mic64_with_aad() {
        let key = [0x42u8; 16];
        let nonce = [0x01u8; 13];
        let plaintext = b"control payload";
        let aad = [0xABu8; 16];

        let sealed = ccm_encrypt(&key, &nonce, plaintext, &aad, MicSize::Mic64).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + 8);

        let opened = ccm_decrypt(&key, &nonce, &sealed, &aad, MicSize::Mic64).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = [0x42u8; 16];
        let other = [0x43u8; 16];
        let nonce = [0x01u8; 13];

        let sealed = ccm_encrypt(&key, &nonce, b"data", &[], MicSize::Mic32).unwrap();
        let result = ccm_decrypt(&other, &nonce, &sealed, &[], MicSize::Mic32);
        assert_eq!(result, Err(CcmError::MicMismatch));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [0x42u8; 16];
        let nonce = [0x01u8; 13];

        let sealed = ccm_encrypt(&key, &nonce, b"data", b"label-a", MicSize::Mic32).unwrap();
        let result = ccm_decrypt(&key, &nonce, &sealed, b"label-b", MicSize::Mic32);
        assert_eq!(result, Err(CcmError::MicMismatch));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0x42u8; 16];
        let nonce = [0x01u8; 13];

        let mut sealed = ccm_encrypt(&key, &nonce, b"data", &[], MicSize::Mic32).unwrap();
        sealed[0] ^= 0xFF;
        let result = ccm_decrypt(&key, &nonce, &sealed, &[], MicSize::Mic32);
        assert_eq!(result, Err(CcmError::MicMismatch));
    }

    #[test]
    fn test_truncated_input() {
        let key = [0x42u8; 16];
        let nonce = [0x01u8; 13];
        let result = ccm_decrypt(&key, &nonce, &[0x00, 0x01], &[], MicSize::Mic32);
        assert_eq!(result, Err(CcmError::CiphertextTooShort(4)));
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [0x42u8; 16];
        let nonce = [0x01u8; 13];

        let sealed = ccm_encrypt(&key, &nonce, &[], &[], MicSize::Mic64).unwrap();
        assert_eq!(sealed.len(), 8);
        let opened = ccm_decrypt(&key, &nonce, &sealed, &[], MicSize::Mic64).unwrap();
        assert!(opened.is_empty());
    }
}
