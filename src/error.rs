use std::io;
use std::sync::Arc;

use reqwest::StatusCode;

/// Error type for fetch and cache operations.
///
/// Cloneable so that a single failure can be fanned out to every completion
/// joined to a shared transfer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageError {
    #[error("failed to decode image data: {0}")]
    Decoding(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(Arc<reqwest::Error>),

    #[error("server returned status code {0}")]
    InvalidResponse(StatusCode),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ImageError {
    /// Whether this error is a caller-initiated cancellation.
    ///
    /// UI layers usually drop cancellations silently rather than surfacing
    /// them as hard failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImageError::Cancelled)
    }
}

impl From<reqwest::Error> for ImageError {
    fn from(err: reqwest::Error) -> Self {
        ImageError::Transport(Arc::new(err))
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        ImageError::Io(Arc::new(err))
    }
}
