//! The k1–k4 key derivation functions (Mesh Profile §3.8.2).
//!
//! Every key in the stack is derived from a 128-bit master through these
//! four functions:
//! - `k1` - identity, beacon and provisioning session keys
//! - `k2` - network encryption/privacy keys and the NID
//! - `k3` - the 64-bit Network ID carried in secure network beacons
//! - `k4` - the 6-bit AID identifying application keys on the air

use super::toolbox::{aes_cmac, s1};
use super::KEY_SIZE;

/// Output of [`k2`]: the master network credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct K2Output {
    /// 7-bit network identifier used to select candidate keys on decode.
    pub nid: u8,
    /// Key encrypting the network-layer payload.
    pub encryption_key: [u8; KEY_SIZE],
    /// Key obfuscating the network-layer header.
    pub privacy_key: [u8; KEY_SIZE],
}

/// The `k1` derivation function.
///
/// ```text
/// k1(N, SALT, P) = AES-CMAC(AES-CMAC(SALT, N), P)
/// ```
pub fn k1(n: &[u8], salt: &[u8; KEY_SIZE], p: &[u8]) -> [u8; KEY_SIZE] {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// The `k2` network key material function.
///
/// ```text
/// T  = AES-CMAC(s1("smk2"), N)
/// T1 = AES-CMAC(T, P ‖ 0x01)
/// T2 = AES-CMAC(T, T1 ‖ P ‖ 0x02)
/// T3 = AES-CMAC(T, T2 ‖ P ‖ 0x03)
/// k2(N, P) = (T1 ‖ T2 ‖ T3) mod 2^263
/// ```
///
/// The 263-bit result is NID (7 bits) ‖ EncryptionKey (128) ‖ PrivacyKey
/// (128). `P = 0x00` selects the master (flooding) credentials.
pub fn k2(n: &[u8; KEY_SIZE], p: &[u8]) -> K2Output {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, n);

    let mut buf = Vec::with_capacity(KEY_SIZE + p.len() + 1);
    buf.extend_from_slice(p);
    buf.push(0x01);
    let t1 = aes_cmac(&t, &buf);

    buf.clear();
    buf.extend_from_slice(&t1);
    buf.extend_from_slice(p);
    buf.push(0x02);
    let t2 = aes_cmac(&t, &buf);

    buf.clear();
    buf.extend_from_slice(&t2);
    buf.extend_from_slice(p);
    buf.push(0x03);
    let t3 = aes_cmac(&t, &buf);

    K2Output {
        nid: t1[15] & 0x7f,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// The `k3` derivation function, producing the 64-bit Network ID.
///
/// ```text
/// k3(N) = AES-CMAC(AES-CMAC(s1("smk3"), N), "id64" ‖ 0x01) mod 2^64
/// ```
pub fn k3(n: &[u8; KEY_SIZE]) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, n);
    let out = aes_cmac(&t, b"id64\x01");
    out[8..16].try_into().expect("8-byte tail of a 16-byte MAC")
}

/// The `k4` derivation function, producing the 6-bit AID.
///
/// ```text
/// k4(N) = AES-CMAC(AES-CMAC(s1("smk4"), N), "id6" ‖ 0x01) mod 2^6
/// ```
pub fn k4(n: &[u8; KEY_SIZE]) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, n);
    let out = aes_cmac(&t, b"id6\x01");
    out[15] & 0x3f
}
