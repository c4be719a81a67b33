//! # Builder for ImageServiceConfig
//!
//! This module provides a builder pattern implementation for creating and
//! customizing [`ImageServiceConfig`] instances with a fluent API.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use imagio::ImageServiceConfig;
//!
//! let config = ImageServiceConfig::builder()
//!     .with_memory_capacity(8 * 1024 * 1024)
//!     .with_timeout(Duration::from_secs(60))
//!     .with_user_agent("MyApp/1.0")
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .with_follow_redirects(true)
//!     .build();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::ImageServiceConfig;

/// Builder for creating [`ImageServiceConfig`] instances with a fluent API.
#[derive(Debug, Clone)]
pub struct ImageServiceConfigBuilder {
    /// Internal config being built
    config: ImageServiceConfig,
}

impl ImageServiceConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: ImageServiceConfig::default(),
        }
    }

    /// Set the memory cache byte budget
    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.config.cache.memory_capacity = capacity;
        self
    }

    /// Set the disk cache root directory
    pub fn with_disk_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache.disk_cache_path = Some(path.into());
        self
    }

    /// Set the overall timeout for the entire HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish the initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    /// Build the [`ImageServiceConfig`] instance
    pub fn build(self) -> ImageServiceConfig {
        self.config
    }
}

impl Default for ImageServiceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
