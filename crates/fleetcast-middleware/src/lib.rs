//! `fleetcast-middleware` – transport plumbing.
//!
//! Moves telemetry from the durable stream onto the fanout bus without caring
//! who is watching.
//!
//! # Modules
//!
//! - [`bus`] – topic-keyed publish/subscribe ([`FanoutBus`]) with an
//!   in-process [`LocalBus`]; Redis-backed [`redis_bus::RedisBus`] behind the
//!   `redis` feature.
//! - [`codec`] – raw payload ⇄ [`fleetcast_types::TelemetryRecord`].
//! - [`stream`] – durable stream seams and the in-memory partitioned stream;
//!   Kafka-backed implementations in `kafka` behind the `kafka` feature.
//! - [`ingest`] – the [`StreamIngestor`] loop.

pub mod bus;
pub mod codec;
pub mod ingest;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "redis")]
pub mod redis_bus;
pub mod stream;

pub use bus::{BusSubscription, COMMAND_CHANNEL, FanoutBus, LocalBus, TELEMETRY_CHANNEL};
pub use codec::RecordCodec;
pub use ingest::{IngestConfig, IngestStats, StreamIngestor};
pub use stream::{MemoryStream, MemoryStreamProducer, MemoryStreamSource, RecordProducer, StreamSource};
