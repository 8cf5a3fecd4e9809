//! ECDH on P-256 for the provisioning handshake (Mesh Profile §5.4.2.3).
//!
//! Public keys cross the link as the 64-byte concatenation X ‖ Y of the
//! uncompressed point; the shared secret is the 32-byte X coordinate of
//! the ECDH result.

use p256::ecdh;
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{Coordinates, FromEncodedPoint, ToEncodedPoint};
use rand::rngs::OsRng;
use thiserror::Error;

use super::{PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};

/// Errors from key generation and agreement.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EcdhError {
    /// Scalar bytes are zero or not a canonical field element
    #[error("Invalid private key scalar")]
    InvalidScalar,

    /// Peer coordinates are not a point on P-256
    #[error("Peer public key is not on the curve")]
    InvalidPeerKey,
}

/// A P-256 private key with its uncompressed public point.
pub struct KeyPair {
    secret: p256::NonZeroScalar,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl KeyPair {
    /// Generates a fresh key pair from the OS CSPRNG.
    pub fn random() -> Self {
        Self::from_scalar(p256::NonZeroScalar::random(&mut OsRng))
    }

    /// Builds a key pair from raw big-endian scalar bytes.
    ///
    /// Used by deterministic tests; rejects zero and out-of-range scalars.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, EcdhError> {
        let scalar: Option<p256::NonZeroScalar> =
            p256::NonZeroScalar::from_repr((*bytes).into()).into();
        scalar.map(Self::from_scalar).ok_or(EcdhError::InvalidScalar)
    }

    fn from_scalar(secret: p256::NonZeroScalar) -> Self {
        let point = p256::PublicKey::from_secret_scalar(&secret).to_encoded_point(false);
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        match point.coordinates() {
            Coordinates::Uncompressed { x, y } => {
                public[..32].copy_from_slice(x);
                public[32..].copy_from_slice(y);
            }
            _ => unreachable!("encoded without compression"),
        }
        Self { secret, public }
    }

    /// The public key as X ‖ Y, as it appears in the Public Key PDU.
    pub const fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Computes the shared secret with a peer's X ‖ Y public key.
    ///
    /// Returns the X coordinate of the ECDH point. Fails when the peer
    /// coordinates do not describe a point on the curve; the caller aborts
    /// the session rather than proceeding with an invalid key.
    pub fn diffie_hellman(
        &self,
        peer: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<[u8; SHARED_SECRET_SIZE], EcdhError> {
        let x = GenericArray::from_slice(&peer[..32]);
        let y = GenericArray::from_slice(&peer[32..]);
        let encoded = p256::EncodedPoint::from_affine_coordinates(x, y, false);
        let peer_key: Option<p256::PublicKey> =
            p256::PublicKey::from_encoded_point(&encoded).into();
        let peer_key = peer_key.ok_or(EcdhError::InvalidPeerKey)?;

        let shared = ecdh::diffie_hellman(&self.secret, peer_key.as_affine());
        let mut out = [0u8; SHARED_SECRET_SIZE];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

impl core::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // The scalar stays out of logs.
        f.debug_struct("KeyPair")
            .field("public_x", &hex_prefix(&self.public[..32]))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
}
