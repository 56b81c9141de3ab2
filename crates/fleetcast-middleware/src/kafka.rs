//! Kafka backend for [`StreamSource`] and [`RecordProducer`].
//!
//! | Setting | Value |
//! |---|---|
//! | `group.id` | caller supplied, one consumer-group member per process |
//! | `auto.offset.reset` | `earliest` |
//! | `enable.auto.commit` | `true` |
//! | message key | vehicle VIN, so one vehicle stays on one partition |

use std::time::Duration;

use async_trait::async_trait;
use fleetcast_types::{StartupError, StreamError};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{info, warn};

use crate::stream::{RecordProducer, StreamSource};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer-group member reading raw telemetry from one topic.
pub struct KafkaSource {
    consumer: Option<StreamConsumer>,
    topic: String,
}

impl KafkaSource {
    /// Create the consumer, check the brokers answer, and subscribe.
    pub async fn connect(brokers: &str, topic: &str, group_id: &str) -> Result<Self, StartupError> {
        let brokers = brokers.to_string();
        let topic_name = topic.to_string();
        let group_id = group_id.to_string();

        // Metadata fetch blocks the calling thread.
        let consumer = tokio::task::spawn_blocking(move || -> Result<StreamConsumer, StartupError> {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "true")
                .set("auto.offset.reset", "earliest")
                .set("session.timeout.ms", "30000")
                .create()
                .map_err(|e| StartupError::Stream(e.to_string()))?;
            consumer
                .fetch_metadata(Some(&topic_name), METADATA_TIMEOUT)
                .map_err(|e| StartupError::Stream(format!("brokers {brokers} unreachable: {e}")))?;
            consumer
                .subscribe(&[topic_name.as_str()])
                .map_err(|e| StartupError::Stream(e.to_string()))?;
            Ok(consumer)
        })
        .await
        .map_err(|e| StartupError::Stream(e.to_string()))??;

        info!(topic, "subscribed to telemetry topic");
        Ok(Self {
            consumer: Some(consumer),
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl StreamSource for KafkaSource {
    async fn next_payload(&mut self, max_wait: Duration) -> Result<Option<Vec<u8>>, StreamError> {
        let consumer = self.consumer.as_ref().ok_or(StreamError::Closed)?;
        match tokio::time::timeout(max_wait, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(message.payload().map(<[u8]>::to_vec)),
            Ok(Err(e)) => Err(StreamError::Read(e.to_string())),
        }
    }

    fn close(&mut self) -> Result<(), StreamError> {
        let consumer = self.consumer.take().ok_or(StreamError::Closed)?;
        consumer.unsubscribe();
        info!(topic = %self.topic, "kafka consumer closed");
        Ok(())
    }
}

/// Producer writing raw telemetry keyed by VIN.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, StartupError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| StartupError::Stream(e.to_string()))?;
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl RecordProducer for KafkaProducer {
    async fn produce(&self, key: &str, payload: Vec<u8>) -> Result<(), StreamError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(&payload);
        self.producer
            .send(record, QUEUE_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                warn!(topic = %self.topic, key, error = %e, "kafka produce failed");
                StreamError::Produce(e.to_string())
            })
    }
}
