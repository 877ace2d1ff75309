// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON encoding and SHA-256 hashing.
//!
//! Blob ids, booking fingerprints, and audit chain links all hash the same
//! canonical form: serde_json serialization with object keys sorted (the
//! default `serde_json::Map` is ordered) and decimals rendered as strings.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 over a booking's canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// First eight hex characters, used in deterministic filenames.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize `value` to its canonical JSON string.
///
/// Keys are sorted and the output carries no insignificant whitespace, so
/// equal values always produce byte-identical encodings.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    serde_json::to_string(&v)
}

/// Hex-encoded SHA-256 of the given bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Round-trip helper: decode a canonical JSON string back into `T`.
pub fn from_canonical<T: DeserializeOwned>(json: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json)
}
