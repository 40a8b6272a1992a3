//! The wire-frozen event envelope (spec §6). Every `SystemEvent` serializes to exactly this
//! shape; `schema_version` != 1 is rejected on decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TruthState {
    Ok,
    NoData,
    Fallback,
}

impl std::fmt::Display for TruthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TruthState::Ok => "OK",
            TruthState::NoData => "NO_DATA",
            TruthState::Fallback => "FALLBACK",
        };
        write!(f, "{s}")
    }
}

/// An immutable, append-only record. `event_id` is assigned by the store at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub schema_version: u32,
    pub event_id: u64,
    pub ts: f64,
    pub subsystem: String,
    pub event_type: String,
    pub truth_state: TruthState,
    pub reason: String,
    pub payload: Value,
    pub session_id: String,
}

pub const SCHEMA_VERSION: u32 = 1;

impl SystemEvent {
    /// Validate the §6 envelope invariants: schema_version == 1, reason non-empty, payload is an
    /// object.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "schema_version {} != {SCHEMA_VERSION}",
                self.schema_version
            ));
        }
        if self.reason.trim().is_empty() {
            return Err("reason must be non-empty".into());
        }
        if !self.payload.is_object() {
            return Err("payload must be a JSON object".into());
        }
        Ok(())
    }
}

/// The exact eight-key wire envelope (spec §6). `event_id` is an internal ordering/dedup detail
/// of the store (used by SQLite's primary key and `recent`/`query`) and must never appear on the
/// wire, so this is a distinct type from `SystemEvent` rather than a `#[serde(skip)]` field --
/// callers that need event_id (replay, dedup) keep using `SystemEvent` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub schema_version: u32,
    pub ts: f64,
    pub subsystem: String,
    pub event_type: String,
    pub truth_state: TruthState,
    pub reason: String,
    pub payload: Value,
    pub session_id: String,
}

impl From<&SystemEvent> for WireEvent {
    fn from(event: &SystemEvent) -> Self {
        Self {
            schema_version: event.schema_version,
            ts: event.ts,
            subsystem: event.subsystem.clone(),
            event_type: event.event_type.clone(),
            truth_state: event.truth_state,
            reason: event.reason.clone(),
            payload: event.payload.clone(),
            session_id: event.session_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_event_serializes_to_exactly_eight_keys() {
        let event = SystemEvent {
            schema_version: 1,
            event_id: 42,
            ts: 1.0,
            subsystem: "FUSION".into(),
            event_type: "FUSED_TRACK_UPDATED".into(),
            truth_state: TruthState::Ok,
            reason: "CONFIRMED".into(),
            payload: serde_json::json!({"k": "v"}),
            session_id: "s-1".into(),
        };
        let wire = WireEvent::from(&event);
        let value = serde_json::to_value(&wire).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 8);
        assert!(!obj.contains_key("event_id"));
    }
}
