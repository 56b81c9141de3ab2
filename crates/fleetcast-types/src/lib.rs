//! `fleetcast-types` – shared data model and error taxonomy.
//!
//! Every crate in the workspace speaks in these types: the ingestion loop
//! produces [`TelemetryRecord`]s, the gateway turns viewer requests into
//! [`Command`]s, and the vehicle lookup collaborator answers with
//! [`Vehicle`]s.  Errors are split per concern so that each worker can decide
//! locally whether a failure is transient (log and continue) or fatal.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// Raw JSON shape published by devices onto the telemetry stream.
///
/// Every field is required; a payload missing any of them fails to
/// deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub vehicle_id: String,
    /// Producer-supplied unix timestamp (seconds).
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: f64,
}

/// A validated positional update from one device.
///
/// Immutable once built: fields are only reachable through accessors and the
/// only constructor rejects an empty device identifier.  Timestamps are taken
/// as-is; per-device monotonicity is not checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TelemetryPayload", into = "TelemetryPayload")]
pub struct TelemetryRecord {
    device_id: String,
    observed_at: i64,
    latitude: f64,
    longitude: f64,
    speed: f64,
}

impl TelemetryRecord {
    /// Build a record, rejecting an empty (or whitespace-only) `device_id`.
    pub fn new(
        device_id: impl Into<String>,
        observed_at: i64,
        latitude: f64,
        longitude: f64,
        speed: f64,
    ) -> Result<Self, DecodeError> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(DecodeError::EmptyDeviceId);
        }
        Ok(Self {
            device_id,
            observed_at,
            latitude,
            longitude,
            speed,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Unix timestamp (seconds) as reported by the device.
    pub fn observed_at(&self) -> i64 {
        self.observed_at
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl TryFrom<TelemetryPayload> for TelemetryRecord {
    type Error = DecodeError;

    fn try_from(raw: TelemetryPayload) -> Result<Self, Self::Error> {
        Self::new(
            raw.vehicle_id,
            raw.timestamp,
            raw.latitude,
            raw.longitude,
            raw.speed,
        )
    }
}

impl From<TelemetryRecord> for TelemetryPayload {
    fn from(record: TelemetryRecord) -> Self {
        Self {
            vehicle_id: record.device_id,
            timestamp: record.observed_at,
            latitude: record.latitude,
            longitude: record.longitude,
            speed: record.speed,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Control actions a viewer may send to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Start,
    Stop,
}

impl Action {
    /// Wire spelling of the action (`"START"` / `"STOP"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "START",
            Action::Stop => "STOP",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    /// Case-sensitive: only `"START"` and `"STOP"` are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "START" => Ok(Action::Start),
            "STOP" => Ok(Action::Stop),
            other => Err(ValidationError::UnknownAction(other.to_string())),
        }
    }
}

/// A control command addressed to exactly one device.
///
/// On the command bus a command travels as `"<ACTION>:<vin>"`; inside the
/// process it is always this tagged variant so the device identifier and the
/// action can never get out of sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Start(String),
    Stop(String),
}

impl Command {
    /// Build a command, rejecting an empty device identifier.
    pub fn new(device_id: impl Into<String>, action: Action) -> Result<Self, ValidationError> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(ValidationError::MissingDeviceId);
        }
        Ok(match action {
            Action::Start => Command::Start(device_id),
            Action::Stop => Command::Stop(device_id),
        })
    }

    pub fn action(&self) -> Action {
        match self {
            Command::Start(_) => Action::Start,
            Command::Stop(_) => Action::Stop,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Command::Start(id) | Command::Stop(id) => id,
        }
    }

    /// Render the bus frame, e.g. `"START:VIN-1"`.
    pub fn to_wire(&self) -> String {
        format!("{}:{}", self.action(), self.device_id())
    }

    /// Parse a bus frame produced by [`Command::to_wire`].
    ///
    /// Splits on the first `:` only, so identifiers containing colons survive.
    pub fn parse_wire(frame: &str) -> Result<Self, ValidationError> {
        let (action, device_id) = frame
            .split_once(':')
            .ok_or_else(|| ValidationError::MalformedCommand(frame.to_string()))?;
        Command::new(device_id, action.parse()?)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action(), self.device_id())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vehicle records (external lookup collaborator)
// ─────────────────────────────────────────────────────────────────────────────

/// Tri-state vehicle status as reported by the record store.
///
/// Serialized as its numeric code, which is what dashboard clients expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum VehicleStatus {
    #[default]
    Unspecified,
    Offline,
    Online,
}

impl VehicleStatus {
    /// Map a free-form record-store status string (`"Online"`, `"offline"`,
    /// …) onto the tri-state.  Unknown values become `Unspecified`.
    pub fn from_record(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "online" => VehicleStatus::Online,
            "offline" => VehicleStatus::Offline,
            _ => VehicleStatus::Unspecified,
        }
    }
}

impl From<VehicleStatus> for u8 {
    fn from(status: VehicleStatus) -> Self {
        match status {
            VehicleStatus::Unspecified => 0,
            VehicleStatus::Offline => 1,
            VehicleStatus::Online => 2,
        }
    }
}

impl From<u8> for VehicleStatus {
    fn from(code: u8) -> Self {
        match code {
            1 => VehicleStatus::Offline,
            2 => VehicleStatus::Online,
            _ => VehicleStatus::Unspecified,
        }
    }
}

/// Identity record for one vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub vin: String,
    pub license_plate: String,
    #[serde(default)]
    pub status: VehicleStatus,
}

/// One page of a vehicle listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VehiclePage {
    pub items: Vec<Vehicle>,
    pub total: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// A telemetry payload that cannot become a [`TelemetryRecord`].
///
/// Never fatal: the ingestion loop logs it, drops the payload and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed telemetry payload: {0}")]
    Malformed(String),

    #[error("telemetry payload has an empty vehicle_id")]
    EmptyDeviceId,
}

/// A command request rejected before any side effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid action {0:?}. Must be STOP or START")]
    UnknownAction(String),

    #[error("vehicle identifier is required")]
    MissingDeviceId,

    #[error("malformed command frame {0:?}")]
    MalformedCommand(String),
}

/// The fanout bus refused or could not carry a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("fanout bus unavailable: {0}")]
    Unavailable(String),

    #[error("fanout channel {0:?} is closed")]
    Closed(String),
}

/// Failures reading from or writing to the durable telemetry stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream read failed: {0}")]
    Read(String),

    #[error("stream produce failed: {0}")]
    Produce(String),

    #[error("stream is closed")]
    Closed,
}

/// A push to one viewer failed; the viewer is considered dead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionWriteError {
    #[error("viewer transport error: {0}")]
    Transport(String),

    #[error("viewer write timed out after {0:?}")]
    TimedOut(Duration),

    #[error("viewer connection already closed")]
    Closed,
}

/// Failure of the viewer-facing command path; always surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("command publish failed: {0}")]
    Publish(#[from] PublishError),
}

/// Failure of the external vehicle-record lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("vehicle not found: {0}")]
    NotFound(String),

    #[error("vehicle lookup exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("vehicle lookup cancelled by shutdown")]
    Cancelled,

    #[error("vehicle record service error: {0}")]
    Upstream(String),
}

/// A required dependency was unavailable at process start.
///
/// The process must exit instead of serving traffic half-initialised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("telemetry stream unreachable: {0}")]
    Stream(String),

    #[error("fanout bus unreachable: {0}")]
    Bus(String),

    #[error("cannot bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("{0} support is not compiled in; rebuild with `--features {0}`")]
    Unsupported(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}
