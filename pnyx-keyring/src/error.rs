//! Error types for the keyring crate.

use crate::trust::TrustLevel;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("keyring is locked")]
    Locked,

    #[error("invalid identity")]
    InvalidIdentity,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unknown identity: {identity}")]
    UnknownIdentity { identity: String },

    #[error("insufficient trust for identity {identity} ({level}/{threshold})", threshold = TrustLevel::THRESHOLD)]
    InsufficientTrust {
        identity: String,
        level: TrustLevel,
    },

    #[error("invalid PEM armor: {0}")]
    Armor(String),

    #[error("bad passphrase or corrupted private key block")]
    Decrypt,
}
