//! Cryptographic primitives for PnyxDB.
//!
//! All Ed25519 signing, verification, and SHA-512 digesting go through this
//! module, providing a single audit surface.
//!
//! The canonical signing pattern: compute `sha512(borsh(message))` with the
//! signature field cleared, then sign the 64-byte digest.

use crate::types::Digest;
use ed25519_dalek::{Signer, Verifier};

/// Compute the SHA-512 digest of arbitrary bytes.
#[inline]
pub fn digest(data: &[u8]) -> Digest {
    use sha2::{Digest as _, Sha512};
    let mut hasher = Sha512::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// Size of a serialized Ed25519 public key.
pub const PUBLIC_KEY_BYTES: usize = 32;

/// Generate a fresh Ed25519 signing key from the OS entropy source.
pub fn generate_signing_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Sign a digest with an Ed25519 signing key.
pub fn sign_digest(key: &ed25519_dalek::SigningKey, digest: &Digest) -> Vec<u8> {
    key.sign(digest.as_bytes()).to_bytes().to_vec()
}

/// Sign raw bytes with an Ed25519 signing key.
pub fn sign_bytes(key: &ed25519_dalek::SigningKey, data: &[u8]) -> Vec<u8> {
    key.sign(data).to_bytes().to_vec()
}

/// Verify an Ed25519 signature over a digest.
pub fn verify_digest(public: &[u8], digest: &Digest, signature: &[u8]) -> Result<(), CryptoError> {
    verify_bytes(public, digest.as_bytes(), signature)
}

/// Verify an Ed25519 signature over raw bytes.
pub fn verify_bytes(public: &[u8], data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let vk = verifying_key(public)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    vk.verify(data, &sig).map_err(|_| CryptoError::InvalidSignature)
}

/// True when the bytes form a valid Ed25519 public key.
pub fn validate_public(public: &[u8]) -> bool {
    verifying_key(public).is_ok()
}

fn verifying_key(public: &[u8]) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
    let bytes: [u8; PUBLIC_KEY_BYTES] = public
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Cryptographic operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid Ed25519 signature")]
    InvalidSignature,

    #[error("invalid Ed25519 public key")]
    InvalidPublicKey,
}
