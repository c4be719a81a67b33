use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = concat!("imagio/", env!("CARGO_PKG_VERSION"));

/// Default byte budget for the memory cache.
const DEFAULT_MEMORY_CAPACITY: usize = 30 * 1024 * 1024;

/// Configuration for the two cache tiers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total cost of resident memory cache entries, in bytes.
    pub memory_capacity: usize,
    /// Root directory for the disk store; the platform caches directory is
    /// used when `None`.
    pub disk_cache_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            disk_cache_path: None,
        }
    }
}

impl CacheConfig {
    /// Directory the disk store will use, resolving the platform default.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        match &self.disk_cache_path {
            Some(path) => path.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("imagio"),
        }
    }
}

/// Configurable options for the image service.
#[derive(Debug, Clone)]
pub struct ImageServiceConfig {
    /// Cache tier configuration.
    pub cache: CacheConfig,

    /// Overall timeout for the entire HTTP request; zero leaves the
    /// transport's own defaults in place.
    pub timeout: Duration,

    /// Connection timeout (time to establish the initial connection); zero
    /// leaves the transport's own defaults in place.
    pub connect_timeout: Duration,

    /// Whether to follow redirects.
    pub follow_redirects: bool,

    /// User agent string.
    pub user_agent: String,

    /// Custom HTTP headers sent with every request.
    pub headers: HeaderMap,
}

impl Default for ImageServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            timeout: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: ImageServiceConfig::default_headers(),
        }
    }
}

impl ImageServiceConfig {
    pub fn builder() -> crate::builder::ImageServiceConfigBuilder {
        crate::builder::ImageServiceConfigBuilder::new()
    }

    /// Headers sent with every request. Content encoding is negotiated by
    /// the transport itself, which also transparently decompresses.
    pub fn default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/png,image/*;q=0.8,*/*;q=0.5"),
        );

        default_headers
    }
}
