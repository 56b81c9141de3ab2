//! `fleetcast-runtime` – process wiring for the fan-out service.
//!
//! # Modules
//!
//! - [`pipeline`] – [`Pipeline`]: opens the telemetry subscription, then
//!   spawns the ingestion loop, the bus-to-queue pump and the
//!   [`Broadcaster`][fleetcast_gateway::Broadcaster].  [`PipelineHandle::shutdown`]
//!   stops and joins all of them.
//! - [`simulator`] – [`DeviceSimulator`]: a fake vehicle that produces
//!   random-walk telemetry onto the stream and obeys `STOP`/`START`
//!   commands addressed to its VIN.
//! - [`telemetry`] – [`init_tracing`]: installs the global `tracing`
//!   subscriber with compact or JSON output and an optional OTLP span
//!   exporter (`OTEL_EXPORTER_OTLP_ENDPOINT`).

pub mod pipeline;
pub mod simulator;
pub mod telemetry;

pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle};
pub use simulator::{DeviceSimulator, SimulatorConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
