//! # Cache Types
//!
//! Common types shared by the caching tiers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Download state of a cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheState {
    /// Complete and immutable payload.
    Downloaded,
    /// Partial transfer that may be continued if the remote resource is
    /// unchanged, identified by the stored validator (an entity tag or
    /// last-modified timestamp).
    Resumable { validator: Option<String> },
}

/// A cached byte payload plus its download state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Raw encoded image data. For `Resumable` entries this is a strict
    /// prefix of the eventual complete payload.
    pub payload: Bytes,
    /// Whether the payload is complete or a resumable prefix.
    pub state: CacheState,
}

impl CacheEntry {
    /// Create an entry for a completed transfer.
    pub fn downloaded(payload: Bytes) -> Self {
        Self {
            payload,
            state: CacheState::Downloaded,
        }
    }

    /// Create an entry for an interrupted transfer that may be resumed.
    pub fn resumable(payload: Bytes, validator: Option<String>) -> Self {
        Self {
            payload,
            state: CacheState::Resumable { validator },
        }
    }

    /// Cost of this entry against the memory cache byte budget.
    pub fn cost(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is complete.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, CacheState::Downloaded)
    }
}

/// Convert an address to a filename-safe string.
///
/// Arbitrary address strings map deterministically to fixed-length hex
/// digests, so any URL can be persisted under the cache root.
pub fn cache_filename(address: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());

    let hash = hasher.finalize();
    format!("{hash:x}")
}
