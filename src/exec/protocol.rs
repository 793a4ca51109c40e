//! Exec event protocol - inline events on agent stdout
//!
//! Agents running on sprites surface structured events by printing lines of
//! the form `LATTICE_EVENT <json>` where the JSON object is
//! `{"type": ..., "data": {...}}`. The parser is stateless per line and
//! deliberately independent of the exec session. Anything unrecognized —
//! wrong prefix, malformed JSON, unknown type — passes through as plain
//! text; agent output must never be swallowed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix marking a protocol event line.
pub const EVENT_PREFIX: &str = "LATTICE_EVENT ";

/// A recognized protocol event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Progress {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    Warning { message: String },
    Checkpoint { message: String },
}

/// One parsed stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Event(ProtocolEvent),
    Text(String),
}

/// Parse one stdout line.
pub fn parse_line(line: &str) -> ParsedLine {
    let Some(raw) = line.strip_prefix(EVENT_PREFIX) else {
        return ParsedLine::Text(line.to_string());
    };

    // The tagged-enum shape rejects unknown types and missing fields in one
    // step; any failure falls back to text.
    match serde_json::from_str::<ProtocolEvent>(raw) {
        Ok(event) => ParsedLine::Event(event),
        Err(_) => ParsedLine::Text(line.to_string()),
    }
}

/// Whether a line carries the event prefix (cheap pre-check).
pub fn looks_like_event(line: &str) -> bool {
    line.starts_with(EVENT_PREFIX)
}

/// Extract the `message` field common to all event types.
impl ProtocolEvent {
    pub fn message(&self) -> &str {
        match self {
            Self::Progress { message, .. } | Self::Warning { message } | Self::Checkpoint { message } => {
                message
            }
        }
    }

    /// The raw JSON `data` payload, reconstructed.
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get("data").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}
