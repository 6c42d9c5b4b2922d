//! Locked flake references and their fingerprints.
//!
//! Locking a flake reference is the job of an external oracle ( the host
//! evaluator ); this module only models the locked result: a URI string, an
//! exploded attribute form, and a 256-bit fingerprint which names the
//! flake's package database.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An unlocked flake reference: either a URI string or an exploded
/// attribute set, carried as raw JSON.
pub type FlakeRef = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlakeError {
    #[error("failed to lock flake reference: {0}")]
    Lock(String),
    #[error("invalid fingerprint hash '{0}'")]
    InvalidHash(String),
}

/// A 256-bit hash uniquely identifying a locked flake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    pub fn from_hex(hex: &str) -> Result<Self, FlakeError> {
        blake3::Hash::from_hex(hex)
            .map(Fingerprint)
            .map_err(|_| FlakeError::InvalidHash(hex.to_string()))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Fingerprint arbitrary bytes. Hosts with a real flake lock derive the
    /// fingerprint from the locked source tree instead.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Fingerprint(blake3::hash(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex).map_err(D::Error::custom)
    }
}

/// A fully locked flake reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedFlakeRef {
    /// Locked URI string.
    pub string: String,
    /// Exploded form of the URI as an attribute set.
    pub attrs: serde_json::Value,
}

/// A locked flake reference together with its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedFlake {
    pub fingerprint: Fingerprint,
    pub locked_ref: LockedFlakeRef,
}

/// External oracle which pins an unlocked flake reference.
pub trait FlakeLocker {
    fn lock_flake(&self, flake_ref: &FlakeRef) -> Result<LockedFlake, FlakeError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprint_hex_round_trip() {
        let fingerprint = Fingerprint::of_bytes(b"github:NixOS/nixpkgs");
        let parsed = Fingerprint::from_hex(&fingerprint.to_hex()).unwrap();
        assert_eq!(fingerprint, parsed);
    }

    #[test]
    fn rejects_malformed_fingerprints() {
        assert!(matches!(
            Fingerprint::from_hex("not-a-hash"),
            Err(FlakeError::InvalidHash(_))
        ));
    }

    #[test]
    fn fingerprint_serde_is_hex() {
        let fingerprint = Fingerprint::of_bytes(b"x");
        let json = serde_json::to_string(&fingerprint).unwrap();
        assert_eq!(json, format!("\"{}\"", fingerprint.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fingerprint, back);
    }
}
