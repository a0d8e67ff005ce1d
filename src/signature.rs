//! Content-addressed stage signatures
//!
//! A stage signature is a SHA-256 digest over the stage's own dependency
//! digest, the signature of the stage before it and the cache format version.
//! Changing any input of any earlier stage therefore changes every signature
//! after it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Version of the stage artifact format. Bumping it invalidates every cached
/// stage, since it is part of each signature and each artifact's labels.
pub const CACHE_FORMAT_VERSION: &str = "1";

/// Hex-encoded SHA-256 signature of a stage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// Wrap an already computed hex signature
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute a stage signature.
///
/// `predecessor` is the previous stage's signature, or empty for the first
/// stage of an image.
pub fn sign(dependency_digest: &str, predecessor: &str, cache_version: &str) -> Signature {
    let mut hasher = Sha256::new();
    hasher.update(dependency_digest.as_bytes());
    hasher.update([0u8]);
    hasher.update(predecessor.as_bytes());
    hasher.update([0u8]);
    hasher.update(cache_version.as_bytes());
    Signature(hex::encode(hasher.finalize()))
}

/// Digest an ordered list of inputs into a single hex string.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn content_digest<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
