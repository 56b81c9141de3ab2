//! Durable telemetry stream seams.
//!
//! The ingestion loop never talks to a broker directly.  It reads through a
//! [`StreamSource`], and device-side producers (the simulator, tests) write
//! through a [`RecordProducer`].  Two backends exist:
//!
//! - [`MemoryStream`] – an in-process partitioned log used for local runs and
//!   tests.
//! - `KafkaSource` / `KafkaProducer` in [`crate::kafka`] behind the `kafka`
//!   feature.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fleetcast_types::StreamError;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// Reader side of an ordered, partitioned stream (one consumer-group member).
#[async_trait]
pub trait StreamSource: Send {
    /// Wait at most `max_wait` for the next payload.
    ///
    /// `Ok(None)` means nothing arrived in time; callers loop.  Payloads of
    /// one partition come back in the order they were produced.
    async fn next_payload(&mut self, max_wait: Duration) -> Result<Option<Vec<u8>>, StreamError>;

    /// Release every resource held by the source.  Called exactly once by the
    /// ingestion loop, on every exit path.
    fn close(&mut self) -> Result<(), StreamError>;
}

#[async_trait]
impl<S: StreamSource + ?Sized> StreamSource for Box<S> {
    async fn next_payload(&mut self, max_wait: Duration) -> Result<Option<Vec<u8>>, StreamError> {
        (**self).next_payload(max_wait).await
    }

    fn close(&mut self) -> Result<(), StreamError> {
        (**self).close()
    }
}

/// Writer side of the stream.  `key` selects the partition, so records with
/// the same key (a vehicle's VIN) stay ordered.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    async fn produce(&self, key: &str, payload: Vec<u8>) -> Result<(), StreamError>;
}

// ---------------------------------------------------------------------------
// In-memory partitioned stream
// ---------------------------------------------------------------------------

/// Default number of partitions for [`MemoryStream::new`].
pub const DEFAULT_PARTITIONS: usize = 4;

struct Shared {
    partitions: Mutex<Vec<VecDeque<Vec<u8>>>>,
    available: Notify,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn partitions(&self) -> MutexGuard<'_, Vec<VecDeque<Vec<u8>>>> {
        self.partitions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process partitioned log.
///
/// Records are hashed by key onto a fixed number of partitions.  The single
/// reader ([`MemoryStreamSource`]) drains partitions round-robin, so order is
/// preserved per partition but not across partitions, as with a real broker.
pub struct MemoryStream;

impl MemoryStream {
    /// Create a stream with [`DEFAULT_PARTITIONS`] partitions.
    pub fn new() -> (MemoryStreamProducer, MemoryStreamSource) {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Create a stream with `partitions` partitions (at least one).
    pub fn with_partitions(partitions: usize) -> (MemoryStreamProducer, MemoryStreamSource) {
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            partitions: Mutex::new(vec![VecDeque::new(); partitions.max(1)]),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            closed_tx,
        });
        (
            MemoryStreamProducer {
                shared: Arc::clone(&shared),
            },
            MemoryStreamSource { shared, cursor: 0 },
        )
    }
}

/// Producer handle for a [`MemoryStream`].  Cheap to clone.
#[derive(Clone)]
pub struct MemoryStreamProducer {
    shared: Arc<Shared>,
}

impl MemoryStreamProducer {
    /// Append `payload` to the partition selected by `key`.
    pub fn push(&self, key: &str, payload: impl Into<Vec<u8>>) -> Result<(), StreamError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        {
            let mut partitions = self.shared.partitions();
            let index = partition_for(key, partitions.len());
            partitions[index].push_back(payload.into());
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Number of records not yet read.
    pub fn pending(&self) -> usize {
        self.shared.partitions().iter().map(VecDeque::len).sum()
    }

    /// Whether the reader has closed the stream.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// How many times [`StreamSource::close`] was called on the reader.
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    /// Resolve once the reader has closed the stream.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        // The sender lives inside `shared`, which we hold, so this only
        // returns once the flag flips.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[async_trait]
impl RecordProducer for MemoryStreamProducer {
    async fn produce(&self, key: &str, payload: Vec<u8>) -> Result<(), StreamError> {
        self.push(key, payload)
    }
}

/// Reader handle for a [`MemoryStream`].
pub struct MemoryStreamSource {
    shared: Arc<Shared>,
    cursor: usize,
}

/// Pop the next record, starting at `cursor` and moving round-robin.
fn take_next(shared: &Shared, cursor: &mut usize) -> Option<Vec<u8>> {
    let mut partitions = shared.partitions();
    let count = partitions.len();
    for step in 0..count {
        let index = (*cursor + step) % count;
        if let Some(payload) = partitions[index].pop_front() {
            *cursor = (index + 1) % count;
            return Some(payload);
        }
    }
    None
}

#[async_trait]
impl StreamSource for MemoryStreamSource {
    async fn next_payload(&mut self, max_wait: Duration) -> Result<Option<Vec<u8>>, StreamError> {
        let deadline = Instant::now() + max_wait;
        let shared = Arc::clone(&self.shared);
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(StreamError::Closed);
            }
            // A push after this point leaves a permit, so the wakeup is not lost.
            let notified = shared.available.notified();
            if let Some(payload) = take_next(&shared, &mut self.cursor) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) -> Result<(), StreamError> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        self.shared.partitions().iter_mut().for_each(VecDeque::clear);
        self.shared.closed_tx.send_replace(true);
        Ok(())
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}
