//! Schema fingerprints
//!
//! A fingerprint is the SHA256 of the canonical JSON rendering of an object
//! schema's field descriptors. Two processes holding the same field set in the
//! same order produce the same fingerprint, which makes drift between a
//! bootstrapped process and a rehydrated one easy to spot.

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SHA256 fingerprint of a schema's field set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute from a JSON value.
    ///
    /// `serde_json` maps keep keys sorted, so the rendering is canonical for
    /// objects; array order is significant.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let canonical = serde_json::to_string(value).unwrap_or_default();
        Self::from_bytes(canonical.as_bytes())
    }

    /// Full hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and CLI tables
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
