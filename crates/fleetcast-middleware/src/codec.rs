//! [`RecordCodec`] – raw telemetry bytes ⇄ [`TelemetryRecord`].
//!
//! Decoding is all-or-nothing: a payload that is not UTF-8 JSON, lacks a
//! required field, or carries an empty `vehicle_id` yields a [`DecodeError`]
//! and nothing is forwarded.

use fleetcast_types::{DecodeError, TelemetryPayload, TelemetryRecord};

/// Stateless JSON codec for device telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn new() -> Self {
        Self
    }

    /// Parse and validate one raw payload.
    pub fn decode(&self, bytes: &[u8]) -> Result<TelemetryRecord, DecodeError> {
        let raw: TelemetryPayload =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        TelemetryRecord::try_from(raw)
    }

    /// Canonical wire form republished to the broadcast tier.
    ///
    /// Unknown fields present in the inbound payload are not carried over.
    pub fn encode(&self, record: &TelemetryRecord) -> String {
        let raw = TelemetryPayload::from(record.clone());
        // A struct of strings, integers and floats always serializes; floats
        // parsed from JSON are finite.
        serde_json::to_string(&raw).unwrap_or_default()
    }
}
