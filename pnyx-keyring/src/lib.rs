//! Security primitives for PnyxDB consortium networks.
//!
//! A [`KeyRing`] holds the node's Ed25519 private key (PEM-armored,
//! AES-256-CBC encrypted) and a directory of peer public keys with trust
//! levels. Peer signatures are only accepted when the signer's effective
//! trust, computed through a PGP-like web of trust, reaches the
//! verification threshold.

pub mod armor;
pub mod error;
pub mod keyring;
pub mod trust;

pub use armor::{PEM_PRIVATE_TYPE, PEM_PUBLIC_TYPE};
pub use error::KeyRingError;
pub use keyring::{Key, KeyRing, TrustSignature};
pub use trust::TrustLevel;
