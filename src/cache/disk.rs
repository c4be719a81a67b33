//! # Disk Store
//!
//! Persists payloads under a content-derived filename (the SHA-256 digest
//! of the address) with a JSON metadata sidecar recording the entry state,
//! validator, and write time. Reads and writes funnel through a single
//! background worker task, so a read issued after a scheduled write for the
//! same address observes that write.
//!
//! Filesystem errors on the read path are logged and reported as a miss;
//! they never fail a fetch, since the network path is always a fallback.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::types::{CacheEntry, CacheState, cache_filename};
use crate::error::ImageError;

/// Sidecar metadata persisted next to each payload file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    #[serde(flatten)]
    state: CacheState,
    /// Unix seconds at which the entry was written (second precision).
    cached_at: u64,
    /// Payload size in bytes at write time.
    size: u64,
}

enum Job {
    Write {
        address: String,
        entry: CacheEntry,
    },
    Read {
        address: String,
        reply: oneshot::Sender<Option<CacheEntry>>,
    },
    Exists {
        address: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to the background disk store worker.
#[derive(Clone)]
pub struct DiskStore {
    cache_dir: PathBuf,
    jobs: mpsc::UnboundedSender<Job>,
}

impl DiskStore {
    /// Create a store rooted at `cache_dir` and spawn its worker task.
    ///
    /// Fails only if the cache root cannot be created, which is treated as
    /// an unrecoverable configuration error.
    pub async fn new(cache_dir: PathBuf) -> Result<Self, ImageError> {
        fs::create_dir_all(&cache_dir).await?;

        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(cache_dir.clone(), rx));

        Ok(Self { cache_dir, jobs })
    }

    /// Whether a payload file exists for the address.
    ///
    /// Goes through the worker queue, so writes scheduled before this call
    /// are observed.
    pub async fn exists(&self, address: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .jobs
            .send(Job::Exists {
                address: address.to_owned(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Schedule a fire-and-forget write of `entry` under the address key.
    pub fn write(&self, address: &str, entry: CacheEntry) {
        let _ = self.jobs.send(Job::Write {
            address: address.to_owned(),
            entry,
        });
    }

    /// Read the entry for an address, returning `None` on miss or any
    /// filesystem error.
    pub async fn read(&self, address: &str) -> Option<CacheEntry> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Read {
                address: address.to_owned(),
                reply,
            })
            .ok()?;
        rx.await.unwrap_or(None)
    }

    /// Root directory of this store.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

async fn run_worker(cache_dir: PathBuf, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Write { address, entry } => {
                if let Err(e) = write_entry(&cache_dir, &address, &entry).await {
                    warn!(address, error = %e, "failed to write cache entry");
                }
            }
            Job::Read { address, reply } => {
                let _ = reply.send(read_entry(&cache_dir, &address).await);
            }
            Job::Exists { address, reply } => {
                let present = fs::try_exists(cache_dir.join(cache_filename(&address)))
                    .await
                    .unwrap_or(false);
                let _ = reply.send(present);
            }
        }
    }
}

async fn write_entry(cache_dir: &Path, address: &str, entry: &CacheEntry) -> io::Result<()> {
    let data_path = cache_dir.join(cache_filename(address));
    let meta_path = data_path.with_extension("meta");

    // The cache root is created up front, but recreate it lazily in case it
    // was removed underneath us.
    if let Some(parent) = data_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let metadata = EntryMetadata {
        state: entry.state.clone(),
        cached_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        size: entry.payload.len() as u64,
    };
    let metadata_json = serde_json::to_vec(&metadata).map_err(io::Error::other)?;

    // Write to temporary files then rename, so a crash mid-write never
    // leaves a half-written entry under the final name.
    let temp_data_path = data_path.with_extension("tmp");
    let temp_meta_path = data_path.with_extension("meta.tmp");

    fs::write(&temp_data_path, &entry.payload).await?;

    if let Err(e) = fs::write(&temp_meta_path, &metadata_json).await {
        let _ = fs::remove_file(&temp_data_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_data_path, &data_path).await {
        let _ = fs::remove_file(&temp_data_path).await;
        let _ = fs::remove_file(&temp_meta_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_meta_path, &meta_path).await {
        // The data file landed but its metadata did not; drop both rather
        // than leave an inconsistent pair.
        let _ = fs::remove_file(&data_path).await;
        let _ = fs::remove_file(&temp_meta_path).await;
        return Err(e);
    }

    debug!(address, size = entry.payload.len(), "cache entry written");
    Ok(())
}

async fn read_entry(cache_dir: &Path, address: &str) -> Option<CacheEntry> {
    let data_path = cache_dir.join(cache_filename(address));
    let meta_path = data_path.with_extension("meta");

    let metadata_bytes = match fs::read(&meta_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(address, error = %e, "failed to read cache metadata file");
            return None;
        }
    };

    let metadata: EntryMetadata = match serde_json::from_slice(&metadata_bytes) {
        Ok(m) => m,
        Err(e) => {
            warn!(address, error = %e, "failed to parse cache metadata, dropping entry");
            let _ = fs::remove_file(&data_path).await;
            let _ = fs::remove_file(&meta_path).await;
            return None;
        }
    };

    let data = match fs::read(&data_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(address, error = %e, "failed to read cache data file");
            return None;
        }
    };

    if data.len() as u64 != metadata.size {
        warn!(
            address,
            expected = metadata.size,
            actual = data.len(),
            "cache data size does not match metadata, dropping entry"
        );
        let _ = fs::remove_file(&data_path).await;
        let _ = fs::remove_file(&meta_path).await;
        return None;
    }

    Some(CacheEntry {
        payload: Bytes::from(data),
        state: metadata.state,
    })
}
