//! [`DeviceSimulator`] – a fake vehicle for local runs and demos.
//!
//! Every tick it random-walks its position, picks a speed, and produces one
//! raw telemetry payload onto the stream keyed by its VIN.  It also listens
//! on the command channel:
//!
//! | Frame | Effect |
//! |---|---|
//! | `STOP:<own vin>` | stop producing |
//! | `START:<own vin>` | resume producing |
//! | anything else | ignored |

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetcast_middleware::{COMMAND_CHANNEL, FanoutBus, RecordProducer};
use fleetcast_types::{Command, TelemetryPayload};
use futures_util::{StreamExt, stream};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Start position used when none is configured (Shanghai, the Bund).
pub const DEFAULT_START: (f64, f64) = (31.2397, 121.4998);

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub vin: String,
    /// `(latitude, longitude)`
    pub start: (f64, f64),
    pub interval: Duration,
    /// Largest per-tick change in latitude and in longitude, in degrees.
    pub step: f64,
    /// km/h
    pub speed: Range<f64>,
    pub command_channel: String,
}

impl SimulatorConfig {
    pub fn new(vin: impl Into<String>) -> Self {
        Self {
            vin: vin.into(),
            start: DEFAULT_START,
            interval: Duration::from_secs(1),
            step: 0.0005,
            speed: 40.0..80.0,
            command_channel: COMMAND_CHANNEL.to_string(),
        }
    }
}

pub struct DeviceSimulator {
    config: SimulatorConfig,
    producer: Arc<dyn RecordProducer>,
    bus: Arc<dyn FanoutBus>,
    rng: StdRng,
    position: (f64, f64),
    running: bool,
}

impl DeviceSimulator {
    pub fn new(config: SimulatorConfig, producer: Arc<dyn RecordProducer>, bus: Arc<dyn FanoutBus>) -> Self {
        Self {
            position: config.start,
            config,
            producer,
            bus,
            rng: StdRng::from_entropy(),
            running: true,
        }
    }

    /// Deterministic random walk.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Produce until `cancel` fires.  Returns how many payloads were produced.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        let vin = self.config.vin.clone();
        let mut commands = match self.bus.subscribe(&self.config.command_channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(vin = %vin, error = %e, "simulator cannot listen for commands; running uncontrolled");
                stream::pending().boxed()
            }
        };

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut produced = 0u64;
        info!(vin = %vin, interval_ms = self.config.interval.as_millis() as u64, "simulator started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = commands.next() => match frame {
                    Some(frame) => self.apply(&frame),
                    None => {
                        warn!(vin = %vin, "command subscription ended");
                        commands = stream::pending().boxed();
                    }
                },
                _ = ticker.tick() => {
                    if self.running && self.emit().await {
                        produced += 1;
                    }
                }
            }
        }

        info!(vin = %vin, produced, "simulator stopped");
        produced
    }

    fn apply(&mut self, frame: &str) {
        let command = match Command::parse_wire(frame) {
            Ok(command) => command,
            Err(e) => {
                warn!(frame, error = %e, "ignoring malformed command");
                return;
            }
        };
        if command.device_id() != self.config.vin {
            return;
        }
        let running = matches!(command, Command::Start(_));
        if running != self.running {
            info!(vin = %self.config.vin, action = %command.action(), "simulator state changed");
        }
        self.running = running;
    }

    /// Advance one tick and produce the payload.
    async fn emit(&mut self) -> bool {
        let payload = self.next_payload();
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot encode simulated payload");
                return false;
            }
        };
        match self.producer.produce(&self.config.vin, bytes).await {
            Ok(()) => {
                debug!(vin = %self.config.vin, lat = payload.latitude, lon = payload.longitude, "simulated telemetry sent");
                true
            }
            Err(e) => {
                warn!(vin = %self.config.vin, error = %e, "simulated telemetry not produced");
                false
            }
        }
    }

    fn next_payload(&mut self) -> TelemetryPayload {
        let step = self.config.step;
        self.position.0 += self.rng.gen_range(-step..=step);
        self.position.1 += self.rng.gen_range(-step..=step);
        let speed = self.rng.gen_range(self.config.speed.clone());
        TelemetryPayload {
            vehicle_id: self.config.vin.clone(),
            timestamp: Utc::now().timestamp(),
            latitude: self.position.0,
            longitude: self.position.1,
            speed,
        }
    }
}
