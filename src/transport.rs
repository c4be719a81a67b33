//! # Network Transport
//!
//! The transfer registry drives downloads through the [`Transport`] trait
//! so the engine can be exercised against a scripted transport in tests.
//! The default implementation speaks HTTP via reqwest and understands the
//! conditional range protocol used to resume partial transfers.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT_RANGES, ETAG, HeaderValue, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, info};

use crate::config::ImageServiceConfig;
use crate::error::ImageError;

/// A boxed stream of payload chunks.
pub type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ImageError>> + Send>>;

/// How the origin answered relative to the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBody {
    /// Full body from byte zero (`200 OK`).
    Full,
    /// Continuation of the requested range (`206 Partial Content`).
    Partial,
}

/// Byte offset and validator for continuing a partial transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFrom {
    /// Offset of the first byte still missing.
    pub offset: u64,
    /// Validator confirming the remote resource is unchanged.
    pub validator: Option<String>,
}

/// A single outbound transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Absolute address of the resource.
    pub address: String,
    /// When present, ask the origin to continue from this position.
    pub resume: Option<ResumeFrom>,
}

/// Response headers plus the body stream for an accepted transfer.
pub struct TransferReply {
    /// Whether the body continues the requested range or restarts.
    pub body: ResponseBody,
    /// Whether the origin advertises byte-range support.
    pub accept_ranges: bool,
    /// Entity tag if present, else the last-modified timestamp.
    pub validator: Option<String>,
    /// Declared body length, when the origin provides one.
    pub content_length: Option<u64>,
    /// Body chunks in arrival order.
    pub stream: BoxByteStream,
}

/// A transport capable of fetching a resource as a byte stream.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue the request and return the response headers plus body stream.
    ///
    /// Non-2xx responses are reported as [`ImageError::InvalidResponse`].
    async fn fetch(&self, request: TransferRequest) -> Result<TransferReply, ImageError>;
}

#[async_trait]
impl<T: Transport> Transport for std::sync::Arc<T> {
    async fn fetch(&self, request: TransferRequest) -> Result<TransferReply, ImageError> {
        (**self).fetch(request).await
    }
}

/// Create a reqwest [`Client`] from the service configuration.
pub fn create_client(config: &ImageServiceConfig) -> Result<Client, ImageError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5) // Allow multiple connections to same host
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(ImageError::from)
}

/// HTTP transport backed by reqwest.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with a client built from the configuration.
    pub fn new(config: &ImageServiceConfig) -> Result<Self, ImageError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    /// Create a transport around an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: TransferRequest) -> Result<TransferReply, ImageError> {
        let url = request
            .address
            .parse::<Url>()
            .map_err(|_| ImageError::InvalidUrl(request.address.clone()))?;

        let mut req = self.client.get(url);
        if let Some(resume) = &request.resume {
            req = req.header(RANGE, format!("bytes={}-", resume.offset));
            if let Some(validator) = &resume.validator {
                if let Ok(value) = HeaderValue::from_str(validator) {
                    req = req.header(IF_RANGE, value);
                }
            }
            debug!(
                address = %request.address,
                offset = resume.offset,
                "resuming transfer with conditional range request"
            );
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::InvalidResponse(status));
        }

        let body = if status == StatusCode::PARTIAL_CONTENT {
            ResponseBody::Partial
        } else {
            ResponseBody::Full
        };
        let (accept_ranges, validator) = extract_range_headers(&response);
        let content_length = response.content_length();

        info!(
            address = %request.address,
            size = ?content_length,
            partial = matches!(body, ResponseBody::Partial),
            "transfer started"
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ImageError::from))
            .boxed();

        Ok(TransferReply {
            body,
            accept_ranges,
            validator,
            content_length,
            stream,
        })
    }
}

/// Extract the range-resumption headers from a response: whether the origin
/// supports byte ranges, and the validator token (entity tag preferred over
/// the last-modified timestamp).
fn extract_range_headers(response: &reqwest::Response) -> (bool, Option<String>) {
    let accept_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let last_modified = response
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    (accept_ranges, etag.or(last_modified))
}
