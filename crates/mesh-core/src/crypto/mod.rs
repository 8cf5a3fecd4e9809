//! Cryptographic primitives for the mesh security toolbox.
//!
//! Implements the algorithm suite of Mesh Profile §3.8:
//! - AES-CMAC (RFC 4493) and the `s1` salt function
//! - The k1/k2/k3/k4 derivation functions
//! - AES-CCM with 32- or 64-bit MIC and 13-byte nonces
//! - ECDH on P-256 for provisioning
//!
//! Everything here is stateless; callers own all key material.

mod ccm;
mod ecdh;
mod kdf;
mod toolbox;

pub use ccm::{ccm_decrypt, ccm_encrypt, CcmError, MicSize};
pub use ecdh::{EcdhError, KeyPair};
pub use kdf::{k1, k2, k3, k4, K2Output};
pub use toolbox::{aes_cmac, aes_encrypt_block, s1};

/// Key size for all symmetric operations.
pub const KEY_SIZE: usize = 16;

/// CCM nonce size.
pub const NONCE_SIZE: usize = 13;

/// Size of an uncompressed P-256 public key (X ‖ Y).
pub const PUBLIC_KEY_SIZE: usize = 64;

/// Size of the ECDH shared secret (X coordinate).
pub const SHARED_SECRET_SIZE: usize = 32;

/// Fills a buffer with bytes from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
