//! AES-CMAC and the `s1` salt primitive (Mesh Profile §3.8.2).
//!
//! AES-CMAC (RFC 4493) is the basis of every derivation in the security
//! toolbox: the salts, the k1–k4 functions, virtual-address hashing and
//! beacon authentication all reduce to it.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use super::KEY_SIZE;

/// Computes AES-CMAC of a message under a 128-bit key.
///
/// # Arguments
/// * `key` - 16-byte key
/// * `message` - message of any length, including empty
///
/// # Returns
/// 16-byte MAC output
pub fn aes_cmac(key: &[u8; KEY_SIZE], message: &[u8]) -> [u8; KEY_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).expect("CMAC accepts a 16-byte key");
    mac.update(message);
    let mut output = [0u8; KEY_SIZE];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// The `s1` salt generation function.
///
/// ```text
/// s1(M) = AES-CMAC(ZERO, M)
/// ```
///
/// where ZERO is the all-zero 128-bit key.
pub fn s1(message: &[u8]) -> [u8; KEY_SIZE] {
    aes_cmac(&[0u8; KEY_SIZE], message)
}

/// Encrypts a single 16-byte block with AES-128 in ECB mode.
///
/// Used for the privacy counter block (PECB) of network-header obfuscation
/// and nowhere else; everything payload-carrying goes through CCM.
pub fn aes_encrypt_block(key: &[u8; KEY_SIZE], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}
