//! Content fingerprints.
//!
//! A fingerprint is the hex encoding of a 256-bit digest. Both cases are
//! accepted on input; the canonical form is lowercase so that one digest
//! always maps to one identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of hex characters in a fingerprint (32 bytes)
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Rejected fingerprint input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("Fingerprint must be {FINGERPRINT_HEX_LEN} hex characters, got {0}")]
    Length(usize),

    #[error("Fingerprint contains non-hex character {0:?}")]
    Charset(char),
}

/// Normalized 64-character hex digest
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse and normalize a hex fingerprint
    pub fn parse(input: &str) -> Result<Self, FingerprintError> {
        if input.len() != FINGERPRINT_HEX_LEN {
            return Err(FingerprintError::Length(input.chars().count()));
        }

        if let Some(bad) = input.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(FingerprintError::Charset(bad));
        }

        Ok(Self(input.to_ascii_lowercase()))
    }

    /// SHA-256 fingerprint of raw document bytes
    pub fn of_bytes(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
