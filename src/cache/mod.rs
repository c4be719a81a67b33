//! # Cache Tiers
//!
//! Two-tier caching for downloaded payloads: a cost-bounded in-memory LRU
//! in front of an unbounded on-disk store, both keyed by the address
//! string. The cache stores raw encoded bytes only; decoding happens per
//! caller so that the same payload can serve multiple display scales.

mod disk;
mod memory;
mod types;

pub use disk::DiskStore;
pub use memory::MemoryCache;
pub use types::{CacheEntry, CacheState, cache_filename};
