//! `fleetcast-gateway` – the viewer-facing tier.
//!
//! Boots an HTTP + WebSocket server (default port `8081`) that:
//!
//! 1. **Pushes** every telemetry payload leaving the [`BroadcastQueue`] to
//!    every connected viewer through the [`Broadcaster`] and the
//!    [`ConnectionRegistry`].  Each viewer has its own outbound queue and
//!    writer task, so one slow browser cannot stall the others.
//!
//! 2. **Accepts** control requests (`POST /api/v1/vehicles/{vin}/control`)
//!    and hands them to the [`CommandDispatcher`], which validates them and
//!    publishes `"START:<vin>"` / `"STOP:<vin>"` on the command bus.
//!
//! 3. **Proxies** vehicle-record lookups to a [`VehicleDirectory`] under a
//!    per-request deadline.

pub mod broadcaster;
pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod server;
pub mod vehicles;

pub use broadcaster::{BroadcastOutcome, Broadcaster};
pub use dispatcher::CommandDispatcher;
pub use queue::{BroadcastQueue, OverflowPolicy, PushOutcome, QueueClosed};
pub use registry::{ConnectionId, ConnectionRegistry, Delivery, RegistryConfig, ViewerSink};
pub use server::{DEFAULT_PORT, GatewayServer};
pub use vehicles::{HttpVehicleDirectory, InMemoryVehicleDirectory, VehicleDirectory, with_deadline};
