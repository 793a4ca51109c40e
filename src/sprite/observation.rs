//! Sprite observations - typed signals a worker surfaces about itself
//!
//! Observations flow from a sprite process into the pluggable intent
//! generator, which decides whether one warrants a maintenance proposal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of signal the sprite raised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Anomaly,
    Recommendation,
    Metric,
    Status,
}

/// How urgent the signal is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One observation emitted by a sprite process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub sprite_id: String,
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    pub severity: Severity,
    pub data: Value,
    pub at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        sprite_id: impl Into<String>,
        observation_type: ObservationType,
        severity: Severity,
        data: Value,
    ) -> Self {
        Self {
            sprite_id: sprite_id.into(),
            observation_type,
            severity,
            data,
            at: Utc::now(),
        }
    }

    /// Human summary pulled from `data.message` or `data.description`.
    pub fn summary(&self) -> Option<&str> {
        self.data
            .get("message")
            .or_else(|| self.data.get("description"))
            .and_then(Value::as_str)
    }
}
