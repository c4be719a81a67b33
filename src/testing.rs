//! Scripted collaborators for exercising the engine without a network.

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::cache::CacheEntry;

/// Route log output to the test writer so `--nocapture` shows it.
#[inline]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
use crate::decode::{Bitmap, ImageDecoder};
use crate::error::ImageError;
use crate::registry::{CompletionHandler, EntrySink};
use crate::transport::{ResponseBody, TransferReply, TransferRequest, Transport};

enum ScriptedStream {
    /// Finite chunk script, consumed in order.
    Chunks(Vec<Result<Bytes, ImageError>>),
    /// Externally driven body; the test holds the sender.
    Channel(mpsc::Receiver<Result<Bytes, ImageError>>),
}

/// One scripted response for a [`ScriptedTransport`].
pub(crate) struct ScriptedReply {
    pub body: ResponseBody,
    pub accept_ranges: bool,
    pub validator: Option<String>,
    stream: ScriptedStream,
}

impl ScriptedReply {
    /// A full-body response delivering the chunks and ending cleanly.
    pub fn complete(chunks: &[&[u8]]) -> Self {
        Self {
            body: ResponseBody::Full,
            accept_ranges: true,
            validator: Some("\"scripted\"".into()),
            stream: ScriptedStream::Chunks(
                chunks.iter().map(|c| Ok(Bytes::copy_from_slice(c))).collect(),
            ),
        }
    }

    /// A `206 Partial Content` continuation of a resumed request.
    pub fn partial_continuation(chunks: &[&[u8]]) -> Self {
        Self {
            body: ResponseBody::Partial,
            ..Self::complete(chunks)
        }
    }

    /// A response that delivers the chunks then fails with `err`.
    pub fn interrupted(
        chunks: &[&[u8]],
        err: ImageError,
        accept_ranges: bool,
        validator: Option<&str>,
    ) -> Self {
        let mut scripted: Vec<Result<Bytes, ImageError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        scripted.push(Err(err));

        Self {
            body: ResponseBody::Full,
            accept_ranges,
            validator: validator.map(str::to_owned),
            stream: ScriptedStream::Chunks(scripted),
        }
    }

    /// A response whose body is fed by the returned sender, letting tests
    /// hold a transfer open.
    pub fn channel() -> (Self, mpsc::Sender<Result<Bytes, ImageError>>) {
        let (tx, rx) = mpsc::channel(8);
        let reply = Self {
            body: ResponseBody::Full,
            accept_ranges: true,
            validator: Some("\"scripted\"".into()),
            stream: ScriptedStream::Channel(rx),
        };
        (reply, tx)
    }
}

/// Transport that answers from a queue of scripted replies and records
/// every request it sees.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<ScriptedReply, ImageError>>>,
    requests: Mutex<Vec<TransferRequest>>,
    pub calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: Result<ScriptedReply, ImageError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: TransferRequest) -> Result<TransferReply, ImageError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.requests.lock().push(request);

        let scripted = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or(Err(ImageError::InvalidResponse(
                reqwest::StatusCode::NOT_FOUND,
            )))?;

        let stream = match scripted.stream {
            ScriptedStream::Chunks(chunks) => futures::stream::iter(chunks).boxed(),
            ScriptedStream::Channel(rx) => ReceiverStream::new(rx).boxed(),
        };

        Ok(TransferReply {
            body: scripted.body,
            accept_ranges: scripted.accept_ranges,
            validator: scripted.validator,
            content_length: None,
            stream,
        })
    }
}

/// Decoder that wraps the raw payload in a bitmap without parsing it, so
/// tests can assert on the exact bytes a caller received.
pub(crate) struct StubDecoder;

impl ImageDecoder for StubDecoder {
    fn decode(&self, payload: &Bytes, scale: f32) -> Result<Bitmap, ImageError> {
        Ok(Bitmap {
            width: payload.len() as u32,
            height: 1,
            scale,
            data: payload.clone(),
        })
    }
}

/// Decoder that rejects every payload.
pub(crate) struct FailingDecoder;

impl ImageDecoder for FailingDecoder {
    fn decode(&self, _payload: &Bytes, _scale: f32) -> Result<Bitmap, ImageError> {
        Err(ImageError::Decoding("stubbed decode failure".into()))
    }
}

/// Entry sink recording everything published to it.
#[derive(Default)]
pub(crate) struct CollectingSink {
    entries: Mutex<Vec<(String, CacheEntry)>>,
}

impl CollectingSink {
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        self.entries.lock().clone()
    }
}

impl EntrySink for CollectingSink {
    fn publish(&self, address: &str, entry: CacheEntry) {
        self.entries.lock().push((address.to_owned(), entry));
    }
}

/// A completion handler that forwards its result to the returned receiver.
pub(crate) fn capture() -> (
    CompletionHandler,
    oneshot::Receiver<Result<Bitmap, ImageError>>,
) {
    let (tx, rx) = oneshot::channel();
    let handler: CompletionHandler = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (handler, rx)
}
