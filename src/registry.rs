//! # Transfer Registry
//!
//! Tracks at most one in-flight network transfer per address. Callers
//! requesting an address that is already being fetched attach an additional
//! completion to the existing transfer instead of starting a second one.
//!
//! Completions are keyed by monotonically increasing tokens; the handle
//! returned to each caller detaches exactly that completion, and detaching
//! the last one aborts the underlying transfer. Any mutation of the
//! transfer table or a transfer's completion set happens under the mutex;
//! handlers are always invoked outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheState};
use crate::decode::{Bitmap, ImageDecoder};
use crate::error::ImageError;
use crate::transport::{ResponseBody, ResumeFrom, TransferRequest, Transport};

/// Upper bound on buffer preallocation from the declared content length.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

/// Callback invoked exactly once with the final result of a fetch.
pub type CompletionHandler = Box<dyn FnOnce(Result<Bitmap, ImageError>) + Send + 'static>;

/// Receives terminal cache entries produced by transfers.
///
/// Implemented by the caching layer; always called outside the registry
/// lock.
pub trait EntrySink: Send + Sync + 'static {
    /// Store the entry produced by a completed or interrupted transfer.
    fn publish(&self, address: &str, entry: CacheEntry);
}

struct Completion {
    scale: f32,
    handler: CompletionHandler,
}

struct Transfer {
    completions: HashMap<u64, Completion>,
    abort: AbortHandle,
}

/// Partial state carried out of a failed transfer.
struct PartialTransfer {
    payload: Bytes,
    accept_ranges: bool,
    validator: Option<String>,
}

/// Coalesces concurrent fetches for the same address onto one transfer.
pub struct TaskRegistry<T: Transport> {
    transport: Arc<T>,
    decoder: Arc<dyn ImageDecoder>,
    sink: Arc<dyn EntrySink>,
    transfers: Mutex<HashMap<String, Transfer>>,
    next_token: AtomicU64,
}

impl<T: Transport> TaskRegistry<T> {
    /// Create a registry around a transport, decoder, and cache sink.
    pub fn new(
        transport: Arc<T>,
        decoder: Arc<dyn ImageDecoder>,
        sink: Arc<dyn EntrySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            decoder,
            sink,
            transfers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        })
    }

    /// Join the in-flight transfer for `address`, or start a new one.
    ///
    /// `resume` seeds a conditional range request when a resumable cache
    /// entry exists for the address; it is ignored when a transfer is
    /// already in flight (the joined transfer determines the payload).
    pub fn fetch(
        self: &Arc<Self>,
        address: &str,
        scale: f32,
        resume: Option<CacheEntry>,
        handler: CompletionHandler,
    ) -> FetchHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let completion = Completion { scale, handler };

        let mut transfers = self.transfers.lock();
        match transfers.get_mut(address) {
            Some(transfer) => {
                debug!(address, token, "joining in-flight transfer");
                transfer.completions.insert(token, completion);
            }
            None => {
                debug!(address, token, resuming = resume.is_some(), "starting transfer");
                let task = tokio::spawn({
                    let registry = Arc::clone(self);
                    let address = address.to_owned();
                    async move { registry.run_transfer(address, resume).await }
                });

                let mut completions = HashMap::new();
                completions.insert(token, completion);
                transfers.insert(
                    address.to_owned(),
                    Transfer {
                        completions,
                        abort: task.abort_handle(),
                    },
                );
            }
        }
        drop(transfers);

        let registry = Arc::downgrade(self);
        let registry: Weak<dyn CancelTarget> = registry;
        FetchHandle {
            registry,
            address: address.to_owned(),
            token,
        }
    }

    /// Number of transfers currently in flight.
    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().len()
    }

    async fn run_transfer(self: Arc<Self>, address: String, resume: Option<CacheEntry>) {
        let seed = resume.and_then(|entry| match entry.state {
            CacheState::Resumable { validator } => Some((entry.payload, validator)),
            CacheState::Downloaded => None,
        });

        let request = TransferRequest {
            address: address.clone(),
            resume: seed.as_ref().map(|(payload, validator)| ResumeFrom {
                offset: payload.len() as u64,
                validator: validator.clone(),
            }),
        };

        let reply = match self.transport.fetch(request).await {
            Ok(reply) => reply,
            Err(err) => {
                self.settle_failure(&address, err, None);
                return;
            }
        };

        let mut buffer = match (&seed, reply.body) {
            // The origin honored the range request; continue from the prefix.
            (Some((prefix, _)), ResponseBody::Partial) => BytesMut::from(prefix.as_ref()),
            // Resource changed or no resume: the body restarts from byte zero.
            _ => BytesMut::with_capacity(
                reply.content_length.unwrap_or(0).min(MAX_PREALLOC) as usize
            ),
        };

        let accept_ranges = reply.accept_ranges;
        let validator = reply.validator;
        let mut stream = reply.stream;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                Err(err) => {
                    let partial = if buffer.is_empty() {
                        None
                    } else {
                        Some(PartialTransfer {
                            payload: buffer.freeze(),
                            accept_ranges,
                            validator,
                        })
                    };
                    self.settle_failure(&address, err, partial);
                    return;
                }
            }
        }

        self.settle_success(&address, buffer.freeze()).await;
    }

    /// Complete a transfer: publish the payload to the caching layer and
    /// hand it to every registered completion, each decoding independently
    /// at its own requested scale.
    ///
    /// Decoding is CPU-bound, so the fan-out runs on the blocking pool
    /// rather than a reactor thread.
    async fn settle_success(&self, address: &str, payload: Bytes) {
        let completions = self.take_completions(address);
        debug!(
            address,
            size = payload.len(),
            completions = completions.len(),
            "transfer complete"
        );

        self.sink
            .publish(address, CacheEntry::downloaded(payload.clone()));

        let decoder = Arc::clone(&self.decoder);
        let decode = tokio::task::spawn_blocking(move || {
            for (_, completion) in completions {
                let result = decoder.decode(&payload, completion.scale);
                (completion.handler)(result);
            }
        });
        if let Err(e) = decode.await {
            warn!(address, error = %e, "decode task panicked");
        }
    }

    /// Fail a transfer. If the origin advertises byte-range support and
    /// supplied a validator, the partial bytes are kept as a resumable
    /// cache entry instead of being discarded.
    fn settle_failure(&self, address: &str, err: ImageError, partial: Option<PartialTransfer>) {
        let completions = self.take_completions(address);
        warn!(address, error = %err, "transfer failed");

        if let Some(partial) = partial {
            if partial.accept_ranges && partial.validator.is_some() {
                debug!(
                    address,
                    received = partial.payload.len(),
                    "keeping partial transfer for resumption"
                );
                self.sink
                    .publish(address, CacheEntry::resumable(partial.payload, partial.validator));
            }
        }

        for (_, completion) in completions {
            (completion.handler)(Err(err.clone()));
        }
    }

    /// Remove the transfer from the table and take its completion set.
    /// The transfer leaves the registry exactly once, at terminal state.
    fn take_completions(&self, address: &str) -> HashMap<u64, Completion> {
        let mut transfers = self.transfers.lock();
        match transfers.remove(address) {
            Some(transfer) => transfer.completions,
            None => HashMap::new(),
        }
    }
}

/// Internal seam letting handles cancel without naming the transport type.
trait CancelTarget: Send + Sync {
    fn cancel_completion(&self, address: &str, token: u64);
}

impl<T: Transport> CancelTarget for TaskRegistry<T> {
    fn cancel_completion(&self, address: &str, token: u64) {
        let mut removed_handler = None;
        let mut abort_handle = None;
        {
            let mut transfers = self.transfers.lock();
            if let Some(transfer) = transfers.get_mut(address) {
                if let Some(completion) = transfer.completions.remove(&token) {
                    removed_handler = Some(completion.handler);
                    if transfer.completions.is_empty() {
                        if let Some(transfer) = transfers.remove(address) {
                            abort_handle = Some(transfer.abort);
                        }
                    }
                }
            }
        }

        if let Some(abort) = abort_handle {
            debug!(address, "last completion detached, aborting transfer");
            abort.abort();
        }

        if let Some(handler) = removed_handler {
            handler(Err(ImageError::Cancelled));
        }
    }
}

/// Caller-held token detaching one interest registration from a shared
/// transfer.
#[derive(Debug)]
pub struct FetchHandle {
    registry: Weak<dyn CancelTarget>,
    address: String,
    token: u64,
}

impl FetchHandle {
    /// Detach this caller's completion and report `Cancelled` to it.
    ///
    /// Consuming `self` makes cancellation an at-most-once operation per
    /// handle. Cancelling after the transfer has completed is a no-op (the
    /// completion has already been removed). The shared transfer is only
    /// aborted when no other caller remains attached.
    pub fn cancel(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.cancel_completion(&self.address, self.token);
        }
    }

    /// Address this handle is bound to.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        CollectingSink, ScriptedReply, ScriptedTransport, StubDecoder, capture, init_tracing,
    };
    use std::io;
    use std::sync::atomic::Ordering;

    const ADDRESS: &str = "https://example.com/a.png";

    fn registry(
        transport: Arc<ScriptedTransport>,
        sink: Arc<CollectingSink>,
    ) -> Arc<TaskRegistry<ScriptedTransport>> {
        TaskRegistry::new(transport, Arc::new(StubDecoder), sink)
    }

    fn io_err() -> ImageError {
        ImageError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_transfer() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        let (reply, body) = ScriptedReply::channel();
        transport.push(Ok(reply));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), Arc::clone(&sink));

        let (h1, rx1) = capture();
        let (h2, rx2) = capture();
        let _handle1 = registry.fetch(ADDRESS, 1.0, None, h1);
        let _handle2 = registry.fetch(ADDRESS, 2.0, None, h2);

        assert_eq!(registry.transfer_count(), 1);

        body.send(Ok(Bytes::from_static(b"payload"))).await.unwrap();
        drop(body);

        let r1 = rx1.await.unwrap().expect("first caller gets bitmap");
        let r2 = rx2.await.unwrap().expect("second caller gets bitmap");
        assert_eq!(r1.data, Bytes::from_static(b"payload"));
        assert_eq!(r1.scale, 1.0);
        assert_eq!(r2.data, Bytes::from_static(b"payload"));
        assert_eq!(r2.scale, 2.0);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.transfer_count(), 0);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, ADDRESS);
        assert_eq!(
            entries[0].1,
            CacheEntry::downloaded(Bytes::from_static(b"payload"))
        );
    }

    #[tokio::test]
    async fn test_cancel_one_of_two_keeps_transfer_alive() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        let (reply, body) = ScriptedReply::channel();
        transport.push(Ok(reply));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), sink);

        let (h1, rx1) = capture();
        let (h2, rx2) = capture();
        let handle1 = registry.fetch(ADDRESS, 1.0, None, h1);
        let _handle2 = registry.fetch(ADDRESS, 1.0, None, h2);

        handle1.cancel();

        let cancelled = rx1.await.unwrap().expect_err("cancelled caller gets error");
        assert!(cancelled.is_cancelled());
        assert_eq!(registry.transfer_count(), 1, "other caller keeps it alive");

        body.send(Ok(Bytes::from_static(b"data"))).await.unwrap();
        drop(body);

        let survivor = rx2.await.unwrap().expect("surviving caller gets bitmap");
        assert_eq!(survivor.data, Bytes::from_static(b"data"));
    }

    #[tokio::test]
    async fn test_cancelling_all_callers_aborts_transfer() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        let (reply, body) = ScriptedReply::channel();
        transport.push(Ok(reply));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), sink);

        let (h1, rx1) = capture();
        let (h2, rx2) = capture();
        let handle1 = registry.fetch(ADDRESS, 1.0, None, h1);
        let handle2 = registry.fetch(ADDRESS, 1.0, None, h2);

        // Wait for the transfer task to take the body before aborting it,
        // so the abort drops the in-flight stream.
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        handle1.cancel();
        handle2.cancel();

        assert!(rx1.await.unwrap().unwrap_err().is_cancelled());
        assert!(rx2.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(registry.transfer_count(), 0);

        // The aborted task drops its end of the body channel.
        body.closed().await;
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Ok(ScriptedReply::complete(&[b"done"])));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), sink);

        let (h, rx) = capture();
        let handle = registry.fetch(ADDRESS, 1.0, None, h);

        assert!(rx.await.unwrap().is_ok());
        assert_eq!(registry.transfer_count(), 0);

        // Completion already removed; nothing to detach.
        handle.cancel();
    }

    #[tokio::test]
    async fn test_partial_failure_with_validator_keeps_resumable_entry() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Ok(ScriptedReply::interrupted(
            &[b"hello"],
            io_err(),
            true,
            Some("\"etag-1\""),
        )));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), Arc::clone(&sink));

        let (h, rx) = capture();
        let _handle = registry.fetch(ADDRESS, 1.0, None, h);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ImageError::Io(_)));

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].1,
            CacheEntry::resumable(Bytes::from_static(b"hello"), Some("\"etag-1\"".into()))
        );
    }

    #[tokio::test]
    async fn test_partial_failure_without_validator_discards_bytes() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Ok(ScriptedReply::interrupted(&[b"hello"], io_err(), true, None)));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), Arc::clone(&sink));

        let (h, rx) = capture();
        let _handle = registry.fetch(ADDRESS, 1.0, None, h);

        assert!(rx.await.unwrap().is_err());
        assert!(sink.entries().is_empty(), "no resumable entry without validator");
    }

    #[tokio::test]
    async fn test_resume_issues_range_request_at_prefix_length() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Ok(ScriptedReply::partial_continuation(&[b" world"])));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), Arc::clone(&sink));

        let resume = CacheEntry::resumable(Bytes::from_static(b"hello"), Some("\"etag-1\"".into()));
        let (h, rx) = capture();
        let _handle = registry.fetch(ADDRESS, 1.0, Some(resume), h);

        let bitmap = rx.await.unwrap().expect("resumed transfer completes");
        assert_eq!(bitmap.data, Bytes::from_static(b"hello world"));

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].resume,
            Some(ResumeFrom {
                offset: 5,
                validator: Some("\"etag-1\"".into())
            })
        );

        let entries = sink.entries();
        assert_eq!(
            entries.last().unwrap().1,
            CacheEntry::downloaded(Bytes::from_static(b"hello world"))
        );
    }

    #[tokio::test]
    async fn test_resource_changed_restarts_from_zero() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        // Origin answers 200 instead of 206: validator no longer matches.
        transport.push(Ok(ScriptedReply::complete(&[b"brand new body"])));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), sink);

        let resume = CacheEntry::resumable(Bytes::from_static(b"stale"), Some("\"old\"".into()));
        let (h, rx) = capture();
        let _handle = registry.fetch(ADDRESS, 1.0, Some(resume), h);

        let bitmap = rx.await.unwrap().expect("restarted transfer completes");
        assert_eq!(bitmap.data, Bytes::from_static(b"brand new body"));
    }

    #[tokio::test]
    async fn test_request_failure_propagates_to_all_callers() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Err(ImageError::InvalidResponse(
            reqwest::StatusCode::NOT_FOUND,
        )));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), Arc::clone(&sink));

        let (h, rx) = capture();
        let _handle = registry.fetch(ADDRESS, 1.0, None, h);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ImageError::InvalidResponse(_)));
        assert!(sink.entries().is_empty());
        assert_eq!(registry.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_addresses_do_not_coalesce() {
        init_tracing();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Ok(ScriptedReply::complete(&[b"one"])));
        transport.push(Ok(ScriptedReply::complete(&[b"two"])));
        let sink = Arc::new(CollectingSink::default());
        let registry = registry(Arc::clone(&transport), sink);

        let (h1, rx1) = capture();
        let (h2, rx2) = capture();
        let _a = registry.fetch("https://example.com/a.png", 1.0, None, h1);
        let _b = registry.fetch("https://example.com/b.png", 1.0, None, h2);

        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
