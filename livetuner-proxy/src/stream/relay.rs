//! Fan-out of one byte source to many independently paced consumers.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use livetuner_protocol::TS_PAYLOAD_SIZE;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::stream::packet::{ByteSource, StreamError};

/// Size of each chunk read from the source (50 datagram payloads).
pub const RELAY_CHUNK_SIZE: usize = TS_PAYLOAD_SIZE * 50;

/// Chunks a consumer may fall behind before it is disconnected.
pub const DEFAULT_BACKLOG_CHUNKS: usize = 1024;

/// Bytes kept for the first consumer when none is attached yet.
pub const DEFAULT_STARTUP_BACKLOG_BYTES: usize = 4 * 1024 * 1024;

/// Relay tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub chunk_size: usize,
    pub backlog_chunks: usize,
    pub startup_backlog_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: RELAY_CHUNK_SIZE,
            backlog_chunks: DEFAULT_BACKLOG_CHUNKS,
            startup_backlog_bytes: DEFAULT_STARTUP_BACKLOG_BYTES,
        }
    }
}

/// Errors seen by relay consumers.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The relay has been closed.
    #[error("Relay is closed")]
    Closed,

    /// The consumer fell too far behind and was disconnected.
    #[error("Consumer fell behind by {0} chunks")]
    Lagged(u64),

    /// Writing to the consumer's sink failed.
    #[error("Sink write failed: {0}")]
    Sink(#[source] io::Error),
}

pub type ConsumerId = u64;

/// Bookkeeping for one attached consumer.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub attached_at: Instant,
    pub bytes_delivered: u64,
}

/// Chunks produced before anyone attached.
#[derive(Debug, Default)]
struct StartupBacklog {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

struct RelayState {
    tx: Option<broadcast::Sender<Bytes>>,
    /// Present until the first consumer attaches.
    startup: Option<StartupBacklog>,
    consumers: HashMap<ConsumerId, ConsumerInfo>,
    next_id: ConsumerId,
}

/// Distributes a single upstream to any number of consumers.
///
/// Each consumer sees the same bytes in the same order, starting where it
/// attached. The first consumer additionally receives what was produced
/// before it arrived (bounded by `startup_backlog_bytes`).
pub struct MulticastRelay {
    config: RelayConfig,
    state: Mutex<RelayState>,
    bytes_published: AtomicU64,
}

impl MulticastRelay {
    /// Create an open relay with no consumers.
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let (tx, _) = broadcast::channel(config.backlog_chunks.max(1));
        Arc::new(Self {
            config,
            state: Mutex::new(RelayState {
                tx: Some(tx),
                startup: Some(StartupBacklog::default()),
                consumers: HashMap::new(),
                next_id: 1,
            }),
            bytes_published: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Pump `source` into the relay until cancelled or the source fails.
    ///
    /// `on_first_byte` runs once, right after the first chunk of this run is
    /// published. On cancellation the relay is closed and `Ok(())` returned.
    /// On a source error the relay stays open with its consumers attached, so
    /// the caller can resume with another source.
    pub async fn run_until_cancelled<S, F>(
        &self,
        source: &mut S,
        on_first_byte: F,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError>
    where
        S: ByteSource,
        F: FnOnce(),
    {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut on_first_byte = Some(on_first_byte);

        loop {
            let n = match source.read_chunk(&mut buf, cancel).await {
                Ok(0) => return Err(StreamError::Ended),
                Ok(n) => n,
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    debug!("[Relay] source read cancelled");
                    self.close();
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            self.publish(Bytes::copy_from_slice(&buf[..n]));

            if let Some(callback) = on_first_byte.take() {
                callback();
            }
        }
    }

    /// Hand a chunk to every consumer.
    pub fn publish(&self, chunk: Bytes) {
        let len = chunk.len();
        let mut state = self.state.lock();
        let Some(tx) = state.tx.clone() else {
            trace!("[Relay] dropping {} bytes, relay closed", len);
            return;
        };

        if let Some(startup) = state.startup.as_mut() {
            startup.bytes += len;
            startup.chunks.push_back(chunk.clone());
            while startup.bytes > self.config.startup_backlog_bytes {
                match startup.chunks.pop_front() {
                    Some(old) => startup.bytes -= old.len(),
                    None => break,
                }
            }
        }

        match tx.send(chunk) {
            Ok(receivers) => trace!("[Relay] {} bytes to {} consumers", len, receivers),
            Err(_) => trace!("[Relay] no consumers for {} bytes", len),
        }
        drop(state);

        self.bytes_published.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Register a new consumer.
    pub fn attach_consumer(self: &Arc<Self>) -> Result<ConsumerHandle, RelayError> {
        let mut state = self.state.lock();
        let rx = state.tx.as_ref().ok_or(RelayError::Closed)?.subscribe();
        let pending = state
            .startup
            .take()
            .map(|backlog| backlog.chunks)
            .unwrap_or_default();

        let id = state.next_id;
        state.next_id += 1;
        state.consumers.insert(
            id,
            ConsumerInfo {
                id,
                attached_at: Instant::now(),
                bytes_delivered: 0,
            },
        );
        let total = state.consumers.len();
        drop(state);

        info!(
            "[Relay] consumer {} attached ({} backlog chunks), total: {}",
            id,
            pending.len(),
            total
        );

        Ok(ConsumerHandle {
            id,
            rx,
            pending,
            relay: Arc::clone(self),
        })
    }

    /// Remove a consumer registration. Unknown ids are ignored.
    pub fn detach(&self, id: ConsumerId) {
        let mut state = self.state.lock();
        if let Some(info) = state.consumers.remove(&id) {
            debug!(
                "[Relay] consumer {} detached after {} bytes, remaining: {}",
                id,
                info.bytes_delivered,
                state.consumers.len()
            );
        }
    }

    /// Stop accepting data. Consumers drain what they have, then see end of stream.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.tx.take().is_some() {
            state.startup = None;
            info!(
                "[Relay] closed with {} consumers attached",
                state.consumers.len()
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().tx.is_none()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Snapshot of the registered consumers.
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        let mut list: Vec<_> = self.state.lock().consumers.values().cloned().collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Total bytes published since creation.
    pub fn bytes_published(&self) -> u64 {
        self.bytes_published.load(Ordering::Relaxed)
    }

    fn record_delivery(&self, id: ConsumerId, bytes: usize) {
        if let Some(info) = self.state.lock().consumers.get_mut(&id) {
            info.bytes_delivered += bytes as u64;
        }
    }
}

/// One consumer's cursor into the relay. Dropping it detaches the consumer.
pub struct ConsumerHandle {
    id: ConsumerId,
    rx: broadcast::Receiver<Bytes>,
    pending: VecDeque<Bytes>,
    relay: Arc<MulticastRelay>,
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next chunk in order, waiting if none is available. `None` at end of stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, RelayError> {
        if let Some(chunk) = self.pending.pop_front() {
            self.relay.record_delivery(self.id, chunk.len());
            return Ok(Some(chunk));
        }

        match self.rx.recv().await {
            Ok(chunk) => {
                self.relay.record_delivery(self.id, chunk.len());
                Ok(Some(chunk))
            }
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "[Relay] consumer {} lagged by {} chunks, disconnecting",
                    self.id, skipped
                );
                self.relay.detach(self.id);
                Err(RelayError::Lagged(skipped))
            }
        }
    }

    /// Copy the stream into `sink` until end of stream. Returns bytes written.
    ///
    /// A failed write detaches the consumer.
    pub async fn copy_to<W>(&mut self, sink: &mut W) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        while let Some(chunk) = self.read_chunk().await? {
            if let Err(e) = sink.write_all(&chunk).await {
                debug!("[Relay] consumer {} sink failed: {}", self.id, e);
                self.relay.detach(self.id);
                return Err(RelayError::Sink(e));
            }
            total += chunk.len() as u64;
        }
        sink.flush().await.map_err(RelayError::Sink)?;
        Ok(total)
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.relay.detach(self.id);
    }
}
