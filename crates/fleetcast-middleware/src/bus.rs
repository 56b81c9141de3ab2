//! Fanout bus: lightweight, topic-keyed publish/subscribe.
//!
//! The bus carries two kinds of traffic, each on its own named channel:
//!
//! | Channel | Publisher | Subscriber | Payload |
//! |---|---|---|---|
//! | [`TELEMETRY_CHANNEL`] | ingestion loop | broadcast tier | canonical telemetry JSON |
//! | [`COMMAND_CHANNEL`] | command dispatcher | device-side listeners | `"START:<vin>"` / `"STOP:<vin>"` |
//!
//! Nothing is persisted and nothing is replayed: a subscriber only sees
//! messages published after it subscribed.
//!
//! [`LocalBus`] is the in-process implementation built on
//! [`tokio::sync::broadcast`] so that every subscriber receives every message
//! without any single subscriber blocking the others.  A Redis-backed
//! implementation lives in [`crate::redis_bus`] behind the `redis` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fleetcast_types::PublishError;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

/// Default per-channel capacity (number of buffered messages before the
/// oldest ones are dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Channel carrying validated telemetry from ingestion to broadcast.
pub const TELEMETRY_CHANNEL: &str = "vehicle:update";

/// Channel carrying control commands toward devices.
pub const COMMAND_CHANNEL: &str = "vehicle:commands";

/// A live subscription: an infinite stream of payloads that only ends when
/// the underlying channel goes away.
pub type BusSubscription = BoxStream<'static, String>;

/// Publish/subscribe transport shared by the ingestion and command paths.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Publish `payload` on `channel`.
    ///
    /// Returns the number of subscribers that were handed the message.  Zero
    /// subscribers is a normal condition, not an error.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PublishError>;

    /// Open a subscription on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, PublishError>;
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// In-process fanout bus.  Clone it cheaply – all clones share the same
/// underlying broadcast channels.
///
/// Channels are created lazily on first subscription.
#[derive(Clone, Debug)]
pub struct LocalBus {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    closed: Arc<AtomicBool>,
}

impl LocalBus {
    /// Create a bus whose channels each buffer up to `capacity` messages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (a `tokio::sync::broadcast` requirement).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LocalBus capacity must be non-zero");
        Self {
            capacity,
            channels: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Drop every current subscriber of `channel`.  Their streams end; later
    /// subscriptions get a fresh channel.
    pub fn disconnect(&self, channel: &str) {
        self.channels().remove(channel);
    }

    /// Shut the bus down: all subscriptions end and every later publish or
    /// subscribe fails with [`PublishError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels().clear();
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        // The map is only ever mutated by single inserts/removes, so a
        // poisoned guard still holds a consistent map.
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed(channel.to_string()));
        }
        let sender = self.channels().get(channel).cloned();
        match sender {
            // `send` only fails when there are no receivers.
            Some(sender) => Ok(sender.send(payload.to_string()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed(channel.to_string()));
        }
        let receiver = self
            .channels()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Ok(into_subscription(channel.to_string(), receiver))
    }
}

/// Turn a broadcast receiver into a [`BusSubscription`].
///
/// A lagging subscriber logs how many messages it lost and keeps going with
/// the oldest message still buffered.
fn into_subscription(channel: String, receiver: broadcast::Receiver<String>) -> BusSubscription {
    stream::unfold((channel, receiver), |(channel, mut receiver)| async move {
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some((payload, (channel, receiver))),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(channel = %channel, lagged_by = n, "fanout subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LocalBus::default();
        let mut sub = bus.subscribe(TELEMETRY_CHANNEL).await?;

        let delivered = bus.publish(TELEMETRY_CHANNEL, "hello").await?;
        assert_eq!(delivered, 1);
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_message() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LocalBus::default();
        let mut sub1 = bus.subscribe(TELEMETRY_CHANNEL).await?;
        let mut sub2 = bus.subscribe(TELEMETRY_CHANNEL).await?;

        assert_eq!(bus.publish(TELEMETRY_CHANNEL, "m").await?, 2);
        assert_eq!(sub1.next().await.as_deref(), Some("m"));
        assert_eq!(sub2.next().await.as_deref(), Some("m"));
        Ok(())
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalBus::default();
        assert_eq!(bus.publish(COMMAND_CHANNEL, "STOP:VIN-1").await, Ok(0));
    }

    /// A subscriber on the command channel must not see telemetry traffic.
    #[tokio::test]
    async fn channels_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LocalBus::default();
        let mut commands = bus.subscribe(COMMAND_CHANNEL).await?;
        let _telemetry = bus.subscribe(TELEMETRY_CHANNEL).await?;

        bus.publish(TELEMETRY_CHANNEL, "{}").await?;

        let result = tokio::time::timeout(Duration::from_millis(50), commands.next()).await;
        assert!(result.is_err(), "command subscriber must not receive telemetry");
        Ok(())
    }

    /// Flooding a small channel while a subscriber sleeps must not end the
    /// subscription; it resumes with the oldest message still buffered.
    #[tokio::test]
    async fn lagging_subscriber_skips_and_continues() -> Result<(), Box<dyn std::error::Error>> {
        const CAPACITY: usize = 4;
        let bus = LocalBus::new(CAPACITY);
        let mut slow = bus.subscribe(TELEMETRY_CHANNEL).await?;

        for i in 0..100 {
            bus.publish(TELEMETRY_CHANNEL, &i.to_string()).await?;
        }

        let first = slow.next().await.ok_or("subscription ended")?;
        assert_eq!(first, "96");
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_ends_current_subscriptions_only() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LocalBus::default();
        let mut old = bus.subscribe(TELEMETRY_CHANNEL).await?;
        bus.disconnect(TELEMETRY_CHANNEL);
        assert!(old.next().await.is_none());

        let mut fresh = bus.subscribe(TELEMETRY_CHANNEL).await?;
        bus.publish(TELEMETRY_CHANNEL, "after").await?;
        assert_eq!(fresh.next().await.as_deref(), Some("after"));
        Ok(())
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish_and_subscribe() {
        let bus = LocalBus::default();
        bus.close();
        assert!(matches!(
            bus.publish(TELEMETRY_CHANNEL, "x").await,
            Err(PublishError::Closed(_))
        ));
        assert!(bus.subscribe(TELEMETRY_CHANNEL).await.is_err());
    }

    #[tokio::test]
    async fn subscriber_count_tracks_dropped_streams() -> Result<(), Box<dyn std::error::Error>> {
        let bus = LocalBus::default();
        let sub = bus.subscribe(COMMAND_CHANNEL).await?;
        assert_eq!(bus.subscriber_count(COMMAND_CHANNEL), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(COMMAND_CHANNEL), 0);
        Ok(())
    }
}
