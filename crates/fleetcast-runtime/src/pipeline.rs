//! [`Pipeline`] – wires the background workers of the fan-out path.
//!
//! ```text
//! StreamSource ──► StreamIngestor ──► FanoutBus ──► pump ──► BroadcastQueue ──► Broadcaster ──► viewers
//! ```
//!
//! Start-up order matters: the telemetry subscription is opened **before**
//! any worker is spawned.  If it cannot be opened the pipeline refuses to
//! start ([`StartupError::Bus`]) and the stream source is closed, so the
//! process never runs half-initialised.  Once running, a subscription that
//! ends is re-opened with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use fleetcast_gateway::{BroadcastQueue, Broadcaster, ConnectionRegistry, OverflowPolicy, PushOutcome};
use fleetcast_middleware::{BusSubscription, FanoutBus, IngestConfig, IngestStats, StreamIngestor, StreamSource};
use fleetcast_types::StartupError;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tuning for [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// First delay before re-subscribing after the subscription ends.
    pub resubscribe_initial: Duration,
    /// Backoff ceiling.
    pub resubscribe_max: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            queue_capacity: fleetcast_gateway::queue::DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            resubscribe_initial: Duration::from_millis(250),
            resubscribe_max: Duration::from_secs(30),
        }
    }
}

pub struct Pipeline {
    bus: Arc<dyn FanoutBus>,
    registry: Arc<ConnectionRegistry>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(bus: Arc<dyn FanoutBus>, registry: Arc<ConnectionRegistry>, config: PipelineConfig) -> Self {
        Self { bus, registry, config }
    }

    /// Subscribe, then spawn the pump, the broadcaster and the ingestion loop.
    pub async fn start<S>(self, mut source: S, cancel: CancellationToken) -> Result<PipelineHandle, StartupError>
    where
        S: StreamSource + 'static,
    {
        let channel = self.config.ingest.channel.clone();
        let subscription = match self.bus.subscribe(&channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(channel = %channel, error = %e, "cannot subscribe to telemetry channel");
                if let Err(close_err) = source.close() {
                    warn!(error = %close_err, "closing telemetry stream failed");
                }
                return Err(StartupError::Bus(e.to_string()));
            }
        };

        let queue = Arc::new(BroadcastQueue::new(self.config.queue_capacity, self.config.overflow));

        let pump = tokio::spawn(pump(
            subscription,
            Arc::clone(&self.bus),
            channel.clone(),
            Arc::clone(&queue),
            cancel.clone(),
            Backoff::new(self.config.resubscribe_initial, self.config.resubscribe_max),
        ));
        let broadcaster = tokio::spawn(Broadcaster::new(Arc::clone(&queue), self.registry).run(cancel.clone()));
        let ingest = tokio::spawn(StreamIngestor::new(source, self.bus, self.config.ingest).run(cancel.clone()));

        info!(
            channel = %channel,
            queue_capacity = queue.capacity(),
            overflow = ?queue.policy(),
            "fan-out pipeline started"
        );

        Ok(PipelineHandle {
            cancel,
            queue,
            pump,
            broadcaster,
            ingest,
        })
    }
}

/// Running pipeline.  Dropping it leaves the workers running until the
/// cancellation token fires; call [`shutdown`](PipelineHandle::shutdown) to
/// stop and join them.
pub struct PipelineHandle {
    cancel: CancellationToken,
    queue: Arc<BroadcastQueue<String>>,
    pump: JoinHandle<u64>,
    broadcaster: JoinHandle<u64>,
    ingest: JoinHandle<IngestStats>,
}

impl PipelineHandle {
    /// The conduit between the subscription and the broadcaster.
    pub fn queue(&self) -> &Arc<BroadcastQueue<String>> {
        &self.queue
    }

    /// Cancel every worker, wait for all of them and report ingestion stats.
    pub async fn shutdown(self) -> IngestStats {
        self.cancel.cancel();
        self.queue.close();

        let stats = match self.ingest.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "ingestion task failed");
                IngestStats::default()
            }
        };
        match self.pump.await {
            Ok(forwarded) => debug!(forwarded, "subscription pump joined"),
            Err(e) => error!(error = %e, "subscription pump failed"),
        }
        match self.broadcaster.await {
            Ok(cycles) => debug!(cycles, "broadcaster joined"),
            Err(e) => error!(error = %e, "broadcaster failed"),
        }
        info!(dropped = self.queue.dropped(), "fan-out pipeline stopped");
        stats
    }
}

// ---------------------------------------------------------------------------
// Subscription pump
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Move payloads from the bus subscription into the queue.  Returns how many
/// payloads were forwarded.
async fn pump(
    mut subscription: BusSubscription,
    bus: Arc<dyn FanoutBus>,
    channel: String,
    queue: Arc<BroadcastQueue<String>>,
    cancel: CancellationToken,
    mut backoff: Backoff,
) -> u64 {
    let mut forwarded = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.next() => next,
        };

        match next {
            Some(payload) => match queue.push(payload).await {
                Ok(PushOutcome::Queued) => forwarded += 1,
                Ok(PushOutcome::EvictedOldest) => {
                    forwarded += 1;
                    debug!("broadcast queue full; evicted oldest payload");
                }
                Ok(PushOutcome::Rejected) => debug!("broadcast queue full; payload dropped"),
                Err(_) => break,
            },
            None => {
                warn!(channel = %channel, "telemetry subscription ended; re-subscribing");
                match resubscribe(bus.as_ref(), &channel, &cancel, &mut backoff).await {
                    Some(fresh) => subscription = fresh,
                    None => break,
                }
            }
        }
    }
    forwarded
}

/// Retry until a subscription opens or `cancel` fires.
async fn resubscribe(
    bus: &dyn FanoutBus,
    channel: &str,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Option<BusSubscription> {
    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match bus.subscribe(channel).await {
            Ok(subscription) => {
                info!(channel, "telemetry subscription re-opened");
                backoff.reset();
                return Some(subscription);
            }
            Err(e) => warn!(channel, error = %e, retry_in_ms = backoff.current.as_millis() as u64, "re-subscribe failed"),
        }
    }
}
