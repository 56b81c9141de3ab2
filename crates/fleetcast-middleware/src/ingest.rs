//! [`StreamIngestor`] – the single ingestion loop.
//!
//! Each pass of the loop:
//!
//! 1. **Read** – wait at most [`IngestConfig::max_wait`] for the next raw
//!    payload from the [`StreamSource`].  The read is never raced against
//!    cancellation; it is bounded instead, so an in-flight read always
//!    completes before the loop observes the token.
//! 2. **Decode** – [`RecordCodec::decode`].  A bad payload is logged, counted
//!    and skipped.
//! 3. **Fan out** – publish the canonical JSON on the telemetry channel of the
//!    [`FanoutBus`].  A failed publish is logged and the record is lost for
//!    this cycle (best effort, at most once).
//!
//! The source is closed exactly once on every exit path (cancellation, a
//! closed source, or a panic unwinding through the loop).

use std::sync::Arc;
use std::time::Duration;

use fleetcast_types::StreamError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{FanoutBus, TELEMETRY_CHANNEL};
use crate::codec::RecordCodec;
use crate::stream::StreamSource;

/// Default bounded wait per read.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(100);

/// Reads never wait less than this, so an empty stream cannot busy-spin the loop.
pub const MIN_MAX_WAIT: Duration = Duration::from_millis(1);

/// Configuration bundle for [`StreamIngestor`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Upper bound on a single blocking read; also bounds how long
    /// cancellation takes to be noticed.
    pub max_wait: Duration,
    /// Fanout channel validated records are republished on.
    pub channel: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            channel: TELEMETRY_CHANNEL.to_string(),
        }
    }
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub published: u64,
    pub decode_errors: u64,
    pub publish_errors: u64,
    pub read_errors: u64,
}

/// Consumes the telemetry stream and feeds the fanout bus.
pub struct StreamIngestor<S> {
    source: S,
    bus: Arc<dyn FanoutBus>,
    codec: RecordCodec,
    config: IngestConfig,
}

impl<S: StreamSource> StreamIngestor<S> {
    /// `config.max_wait` is raised to at least [`MIN_MAX_WAIT`].
    pub fn new(source: S, bus: Arc<dyn FanoutBus>, mut config: IngestConfig) -> Self {
        config.max_wait = config.max_wait.max(MIN_MAX_WAIT);
        Self {
            source,
            bus,
            codec: RecordCodec::new(),
            config,
        }
    }

    /// Run until `cancel` fires or the source reports it is closed.
    pub async fn run(self, cancel: CancellationToken) -> IngestStats {
        let Self {
            source,
            bus,
            codec,
            config,
        } = self;
        let mut guard = SourceGuard { source };
        let mut stats = IngestStats::default();

        info!(channel = %config.channel, max_wait_ms = config.max_wait.as_millis() as u64, "ingestion loop started");

        while !cancel.is_cancelled() {
            let payload = match guard.source.next_payload(config.max_wait).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(StreamError::Closed) => {
                    warn!("telemetry stream closed underneath the ingestion loop");
                    break;
                }
                Err(e) => {
                    stats.read_errors += 1;
                    warn!(error = %e, "stream read failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.max_wait) => {}
                    }
                    continue;
                }
            };

            // A record that arrived after cancellation is not emitted.
            if cancel.is_cancelled() {
                debug!("discarding record read after cancellation");
                break;
            }

            let record = match codec.decode(&payload) {
                Ok(record) => record,
                Err(e) => {
                    stats.decode_errors += 1;
                    warn!(error = %e, bytes = payload.len(), "dropping malformed telemetry payload");
                    continue;
                }
            };

            let encoded = codec.encode(&record);
            let published = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(vehicle_id = record.device_id(), "publish abandoned on cancellation");
                    break;
                }
                result = bus.publish(&config.channel, &encoded) => result,
            };
            match published {
                Ok(receivers) => {
                    stats.published += 1;
                    debug!(vehicle_id = record.device_id(), receivers, "telemetry fanned out");
                }
                Err(e) => {
                    stats.publish_errors += 1;
                    error!(vehicle_id = record.device_id(), error = %e, "fanout publish failed");
                }
            }
        }

        info!(
            published = stats.published,
            decode_errors = stats.decode_errors,
            publish_errors = stats.publish_errors,
            read_errors = stats.read_errors,
            "ingestion loop stopped"
        );
        stats
    }
}

/// Closes the wrapped source when dropped.
struct SourceGuard<S: StreamSource> {
    source: S,
}

impl<S: StreamSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        match self.source.close() {
            Ok(()) => debug!("telemetry stream closed"),
            Err(e) => warn!(error = %e, "closing telemetry stream failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::stream::MemoryStream;
    use async_trait::async_trait;
    use fleetcast_types::PublishError;
    use futures_util::StreamExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const VALID: &str =
        r#"{"vehicle_id":"VIN-1","timestamp":1700000000,"latitude":31.2,"longitude":121.5,"speed":55.0}"#;

    fn config(max_wait_ms: u64) -> IngestConfig {
        IngestConfig {
            max_wait: Duration::from_millis(max_wait_ms),
            ..IngestConfig::default()
        }
    }

    /// Source that replays a script, then idles.
    struct ScriptedSource {
        script: VecDeque<Result<Option<Vec<u8>>, StreamError>>,
        closes: Arc<AtomicUsize>,
        panic_when_empty: bool,
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        async fn next_payload(&mut self, max_wait: Duration) -> Result<Option<Vec<u8>>, StreamError> {
            match self.script.pop_front() {
                Some(step) => step,
                None if self.panic_when_empty => panic!("source exploded"),
                None => {
                    tokio::time::sleep(max_wait).await;
                    Ok(None)
                }
            }
        }

        fn close(&mut self) -> Result<(), StreamError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Bus that fails the first `failures` publishes.
    struct FlakyBus {
        inner: LocalBus,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl FanoutBus for FlakyBus {
        async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PublishError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PublishError::Unavailable("injected".into()));
            }
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<crate::bus::BusSubscription, PublishError> {
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped_and_next_valid_one_published() {
        let bus = LocalBus::default();
        let mut sub = bus.subscribe(TELEMETRY_CHANNEL).await.unwrap();
        let (producer, source) = MemoryStream::with_partitions(1);
        producer.push("X", br#"{"vehicle_id":"X"}"#.to_vec()).unwrap();
        producer.push("VIN-1", VALID.as_bytes().to_vec()).unwrap();

        let cancel = CancellationToken::new();
        let ingestor = StreamIngestor::new(source, Arc::new(bus.clone()), config(10));
        let handle = tokio::spawn(ingestor.run(cancel.clone()));

        let got = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&got).unwrap();
        assert_eq!(json["vehicle_id"], "VIN-1");

        // Nothing else was published.
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.next()).await.is_err());

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_within_one_wait_and_closes_source_once() {
        let max_wait = Duration::from_millis(50);
        let (producer, source) = MemoryStream::new();
        let cancel = CancellationToken::new();
        let ingestor = StreamIngestor::new(
            source,
            Arc::new(LocalBus::default()),
            IngestConfig {
                max_wait,
                ..IngestConfig::default()
            },
        );
        let handle = tokio::spawn(ingestor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), producer.closed())
            .await
            .expect("source was not closed");
        handle.await.unwrap();

        assert!(started.elapsed() < max_wait * 3, "took {:?}", started.elapsed());
        assert_eq!(producer.close_calls(), 1);
    }

    /// Bus whose publish never completes, like a hung connection.
    struct StalledBus;

    #[async_trait]
    impl FanoutBus for StalledBus {
        async fn publish(&self, _: &str, _: &str) -> Result<usize, PublishError> {
            std::future::pending().await
        }

        async fn subscribe(&self, _: &str) -> Result<crate::bus::BusSubscription, PublishError> {
            Ok(futures_util::stream::pending().boxed())
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_publish() {
        let (producer, source) = MemoryStream::new();
        producer.push("VIN-1", VALID.as_bytes().to_vec()).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(StreamIngestor::new(source, Arc::new(StalledBus), config(10)).run(cancel.clone()));

        // Let the loop read the record and block on the bus.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(producer.pending(), 0, "record should have been read");

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("ingestion loop ignored cancellation")
            .unwrap();
        assert_eq!(stats.published, 0);
        assert_eq!(stats.publish_errors, 0);
        assert!(producer.is_closed());
        assert_eq!(producer.close_calls(), 1);
    }

    #[test]
    fn zero_max_wait_is_raised_to_the_minimum() {
        let (_producer, source) = MemoryStream::new();
        let ingestor = StreamIngestor::new(source, Arc::new(LocalBus::default()), config(0));
        assert_eq!(ingestor.config.max_wait, MIN_MAX_WAIT);
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_ingestion() {
        let bus = FlakyBus {
            inner: LocalBus::default(),
            failures: AtomicUsize::new(1),
        };
        let mut sub = bus.subscribe(TELEMETRY_CHANNEL).await.unwrap();
        let (producer, source) = MemoryStream::with_partitions(1);
        producer.push("VIN-1", VALID.as_bytes().to_vec()).unwrap();
        producer.push("VIN-1", VALID.replace("55.0", "60.0").into_bytes()).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(StreamIngestor::new(source, Arc::new(bus), config(10)).run(cancel.clone()));

        let got = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert!(got.contains("60"));

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.publish_errors, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test]
    async fn read_errors_are_transient() {
        let closes = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            script: VecDeque::from([
                Err(StreamError::Read("broker hiccup".into())),
                Ok(Some(VALID.as_bytes().to_vec())),
            ]),
            closes: Arc::clone(&closes),
            panic_when_empty: false,
        };
        let bus = LocalBus::default();
        let mut sub = bus.subscribe(TELEMETRY_CHANNEL).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(StreamIngestor::new(source, Arc::new(bus), config(5)).run(cancel.clone()));

        assert!(tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().is_some());
        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.read_errors, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_source_ends_the_loop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            script: VecDeque::from([Err(StreamError::Closed)]),
            closes: Arc::clone(&closes),
            panic_when_empty: false,
        };
        let stats = StreamIngestor::new(source, Arc::new(LocalBus::default()), config(5))
            .run(CancellationToken::new())
            .await;
        assert_eq!(stats, IngestStats::default());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn source_is_closed_when_the_loop_panics() {
        let closes = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            script: VecDeque::new(),
            closes: Arc::clone(&closes),
            panic_when_empty: true,
        };
        let handle = tokio::spawn(
            StreamIngestor::new(source, Arc::new(LocalBus::default()), config(5)).run(CancellationToken::new()),
        );
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
