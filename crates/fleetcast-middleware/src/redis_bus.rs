//! Redis pub/sub backend for [`FanoutBus`].
//!
//! PUBLISH goes over one shared multiplexed connection.  Every subscription
//! opens its own pub/sub connection, since a connection in subscriber mode
//! cannot issue other commands.

use async_trait::async_trait;
use fleetcast_types::{PublishError, StartupError};
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use crate::bus::{BusSubscription, FanoutBus};

/// Fanout bus backed by a Redis server.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to `url` and verify the server answers a PING.
    pub async fn connect(url: &str) -> Result<Self, StartupError> {
        let client = redis::Client::open(url).map_err(|e| StartupError::Bus(e.to_string()))?;
        let mut publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StartupError::Bus(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut publisher)
            .await
            .map_err(|e| StartupError::Bus(e.to_string()))?;
        info!(url, "connected to redis fanout bus");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, PublishError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, PublishError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let decoded = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match decoded {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "skipping non-text redis message");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
