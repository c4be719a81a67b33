//! # Fetch Orchestration
//!
//! [`ImageService`] is the public entry point: it consults the memory
//! cache, then the disk store, then delegates to the transfer registry,
//! decoding payloads into bitmaps and backfilling both cache tiers on the
//! way out.
//!
//! The service is an explicitly constructed object whose lifetime belongs
//! to the composition root; consumers receive it by reference rather than
//! through global state.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::cache::{CacheEntry, CacheState, DiskStore, MemoryCache};
use crate::config::ImageServiceConfig;
use crate::decode::{ImageDecoder, StandardDecoder};
use crate::error::ImageError;
use crate::registry::{CompletionHandler, EntrySink, FetchHandle, TaskRegistry};
use crate::transport::{HttpTransport, Transport};

/// Backfills both cache tiers with entries produced by transfers.
struct CacheBackfill {
    memory: Arc<MemoryCache>,
    disk: DiskStore,
}

impl EntrySink for CacheBackfill {
    fn publish(&self, address: &str, entry: CacheEntry) {
        self.memory.put(address, entry.clone());
        self.disk.write(address, entry);
    }
}

/// Image acquisition and caching engine.
pub struct ImageService<T: Transport = HttpTransport> {
    memory: Arc<MemoryCache>,
    disk: DiskStore,
    registry: Arc<TaskRegistry<T>>,
    decoder: Arc<dyn ImageDecoder>,
}

impl ImageService<HttpTransport> {
    /// Create a service with the default HTTP transport and decoder.
    pub async fn new(config: ImageServiceConfig) -> Result<Self, ImageError> {
        let transport = HttpTransport::new(&config)?;
        Self::with_parts(config, transport, Arc::new(StandardDecoder)).await
    }
}

impl<T: Transport> ImageService<T> {
    /// Create a service with an explicit transport and decoder.
    pub async fn with_parts(
        config: ImageServiceConfig,
        transport: T,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Result<Self, ImageError> {
        let memory = Arc::new(MemoryCache::new(config.cache.memory_capacity));
        let disk = DiskStore::new(config.cache.resolve_cache_dir()).await?;

        let sink = Arc::new(CacheBackfill {
            memory: Arc::clone(&memory),
            disk: disk.clone(),
        });
        let registry = TaskRegistry::new(Arc::new(transport), Arc::clone(&decoder), sink);

        Ok(Self {
            memory,
            disk,
            registry,
            decoder,
        })
    }

    /// Fetch the image at `address`, decoded at the given display scale.
    ///
    /// The result is delivered through `handler` exactly once. Cache hits
    /// resolve without a network transfer and return no handle; when the
    /// fetch rides a network transfer, the returned handle detaches this
    /// caller on cancel (the shared transfer is only aborted once the last
    /// caller detaches).
    #[instrument(skip(self, handler), level = "debug")]
    pub async fn fetch_image(
        &self,
        address: &str,
        scale: f32,
        handler: CompletionHandler,
    ) -> Option<FetchHandle> {
        if let Err(err) = address.parse::<url::Url>() {
            warn!(address, error = %err, "rejecting unparseable address");
            handler(Err(ImageError::InvalidUrl(address.to_owned())));
            return None;
        }

        let mut resume = None;

        if let Some(entry) = self.memory.get(address) {
            match entry.state {
                CacheState::Downloaded => {
                    debug!(address, "memory cache hit");
                    handler(self.decoder.decode(&entry.payload, scale));
                    return None;
                }
                CacheState::Resumable { .. } => resume = Some(entry),
            }
        }

        if resume.is_none() {
            if let Some(entry) = self.disk.read(address).await {
                match entry.state {
                    CacheState::Downloaded => {
                        debug!(address, "disk cache hit, promoting to memory");
                        self.memory.put(address, entry.clone());
                        handler(self.decoder.decode(&entry.payload, scale));
                        return None;
                    }
                    CacheState::Resumable { .. } => resume = Some(entry),
                }
            }
        }

        Some(self.registry.fetch(address, scale, resume, handler))
    }

    /// Memory cache owned by this service.
    pub fn memory_cache(&self) -> &MemoryCache {
        &self.memory
    }

    /// Disk store owned by this service.
    pub fn disk_store(&self) -> &DiskStore {
        &self.disk
    }

    /// Number of network transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.registry.transfer_count()
    }
}
