//! Content digests: value versions and message signing hashes.
//!
//! Both are raw SHA-512 outputs, but they play different roles and are
//! kept as distinct types: a [`Version`] tags a stored value and serves
//! as the optimistic-concurrency token on the wire and on disk, while a
//! [`Digest`] is the transient hash of a message's unsigned form that
//! Ed25519 signatures are computed over, and never leaves the node.

use std::fmt;

/// Byte width of a SHA-512 digest, and therefore of a marshaled version.
pub const VERSION_BYTES: usize = 64;

/// Returned when two versions do not match.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the stored version does not match with required version")]
pub struct VersionMismatch;

/// 64-byte SHA-512 digest of a stored value.
///
/// The all-zero [`Version::NONE`] is the sentinel meaning "no version",
/// reported by stores for missing keys. Equality is byte equality;
/// persistence and wire form are the raw 64 bytes.
#[derive(
    Clone, Copy, PartialEq, Eq,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Version(#[serde(with = "serde_bytes")] pub [u8; VERSION_BYTES]);

impl Version {
    /// Sentinel returned by stores when no version exists for a key.
    pub const NONE: Version = Version([0u8; VERSION_BYTES]);

    /// Compute the version of a raw value: `SHA-512(value)`.
    pub fn of(data: &[u8]) -> Self {
        use sha2::{Digest as _, Sha512};
        Version(Sha512::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; VERSION_BYTES] {
        &self.0
    }

    /// True for the all-zero sentinel.
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Byte-equality check between two versions.
    pub fn matches(&self, other: &Version) -> Result<(), VersionMismatch> {
        if self.0 != other.0 {
            return Err(VersionMismatch);
        }
        Ok(())
    }
}

impl From<[u8; VERSION_BYTES]> for Version {
    fn from(bytes: [u8; VERSION_BYTES]) -> Self {
        Version(bytes)
    }
}

impl From<Version> for [u8; VERSION_BYTES] {
    fn from(version: Version) -> [u8; VERSION_BYTES] {
        version.0
    }
}

impl TryFrom<&[u8]> for Version {
    type Error = std::array::TryFromSliceError;

    /// Parse the marshaled form: exactly [`VERSION_BYTES`] raw bytes.
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        <[u8; VERSION_BYTES]>::try_from(slice).map(Version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Version {
    // Full versions are 128 hex characters; logs only need a prefix.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({}..)", hex::encode(&self.0[..6]))
    }
}

/// 64-byte SHA-512 digest of the unsigned serialized form of a message.
///
/// This is the cleartext that message signatures sign and verify.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digest(pub [u8; 64]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}..)", hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trip() {
        let inputs: [&[u8]; 4] = [b"", b"42", b"hello world", &[0xff; 129]];
        for data in inputs {
            let v1 = Version::of(data);
            let v2 = Version::of(data);
            assert!(v1.matches(&v2).is_ok());

            let raw: [u8; VERSION_BYTES] = v1.into();
            assert_eq!(v1, Version::from(raw));
            assert_eq!(v1, Version::try_from(&raw[..]).unwrap());
        }
    }

    #[test]
    fn version_mismatch() {
        let a = Version::of(b"a");
        let b = Version::of(b"b");
        assert_eq!(a.matches(&b), Err(VersionMismatch));
        assert!(a.matches(&Version::NONE).is_err());
    }

    #[test]
    fn version_sentinel() {
        assert!(Version::NONE.is_none());
        assert!(!Version::of(b"").is_none());
        assert!(Version::NONE.matches(&Version::NONE).is_ok());
    }

    #[test]
    fn marshaled_form_is_rejected_at_wrong_width() {
        assert!(Version::try_from(&[0u8; 63][..]).is_err());
        assert!(Version::try_from(&[0u8; 65][..]).is_err());
    }

    #[test]
    fn display_is_hex_debug_is_abbreviated() {
        let v = Version([0xab; VERSION_BYTES]);
        assert_eq!(format!("{v}"), "ab".repeat(VERSION_BYTES));
        assert_eq!(format!("{v:?}"), "Version(abababababab..)");

        let d = Digest([0xcd; 64]);
        assert_eq!(format!("{d:?}"), "Digest(cdcdcdcdcdcd..)");
    }
}
