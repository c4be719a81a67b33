//! # Imagio
//!
//! A client-side image acquisition and caching engine: given a remote image
//! address, it returns a decoded bitmap with minimal redundant network
//! traffic, surviving process restarts via persistent storage and avoiding
//! duplicate in-flight downloads for the same address.
//!
//! ## Features
//!
//! - Two-tier caching: a cost-bounded in-memory LRU in front of an
//!   unbounded on-disk store
//! - Request coalescing: concurrent fetches for the same address share a
//!   single network transfer
//! - Resumable downloads: interrupted transfers are continued with
//!   conditional range requests when the origin supports them
//! - Per-caller cancellation that only terminates the shared transfer once
//!   the last interested caller detaches

pub mod builder;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod registry;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::ImageServiceConfigBuilder;
pub use cache::{CacheEntry, CacheState, DiskStore, MemoryCache, cache_filename};
pub use config::{CacheConfig, ImageServiceConfig};
pub use decode::{Bitmap, ImageDecoder, StandardDecoder};
pub use error::ImageError;
pub use registry::{CompletionHandler, EntrySink, FetchHandle, TaskRegistry};
pub use service::ImageService;
pub use transport::{
    BoxByteStream, HttpTransport, ResponseBody, ResumeFrom, TransferReply, TransferRequest,
    Transport, create_client,
};
