//! Audit log - records every capability invocation
//!
//! `record()` sanitizes secret-like argument keys, stamps the entry,
//! emits `["lattice", "safety", "audit"]` telemetry, and publishes the
//! entry on `safety:audit`. It never returns an error and never panics:
//! observer failure must not block the operation being audited.

use crate::events::{telemetry, topics, BusMessage, EventBus};
use crate::safety::classifier::Classification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::config::defaults::AUDIT_RECENT_CAPACITY;

/// Argument keys whose values are replaced before an entry leaves the
/// process.
const SENSITIVE_KEYS: [&str; 6] = ["token", "password", "secret", "key", "api_key", "access_token"];

/// Replacement for sanitized values.
const REDACTED: &str = "[REDACTED]";

// ============================================================================
// Entry types
// ============================================================================

/// Who performed an audited operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    Human,
    Scheduled,
    /// A named operator
    Operator(String),
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Human => write!(f, "human"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Operator(id) => write!(f, "{id}"),
        }
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Ok,
    Error(String),
    Denied,
}

/// One audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub capability: String,
    pub operation: String,
    pub classification: Classification,
    pub result: AuditResult,
    pub actor: Actor,
    /// Call arguments with sensitive keys redacted
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Sanitization
// ============================================================================

/// Replace sensitive keys inside every map in `args`, recursively. Arrays
/// are walked; scalars pass through. Idempotent.
pub fn sanitize_args(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if SENSITIVE_KEYS.contains(&k.as_str()) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), sanitize_args(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_args).collect()),
        other => other.clone(),
    }
}

// ============================================================================
// Audit log
// ============================================================================

/// The audit log: publishes entries and keeps a bounded in-memory ring of
/// recent ones for inspection. Cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    bus: EventBus,
    recent: Arc<Mutex<VecDeque<Arc<AuditEntry>>>>,
}

impl AuditLog {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(AUDIT_RECENT_CAPACITY))),
        }
    }

    /// Record a capability invocation. Infallible: sanitize, stamp, emit
    /// telemetry, publish on `safety:audit`, retain in the recent ring.
    pub fn record(
        &self,
        capability: &str,
        operation: &str,
        classification: Classification,
        result: AuditResult,
        actor: Actor,
        args: Value,
        operator: Option<String>,
    ) -> Arc<AuditEntry> {
        let entry = Arc::new(AuditEntry {
            capability: capability.to_string(),
            operation: operation.to_string(),
            classification,
            result,
            actor,
            args: sanitize_args(&args),
            operator,
            timestamp: Utc::now(),
        });

        telemetry::emit(
            &["lattice", "safety", "audit"],
            json!({}),
            json!({
                "capability": entry.capability,
                "operation": entry.operation,
                "classification": entry.classification,
                "actor": entry.actor.to_string(),
            }),
        );

        self.bus.publish(&topics::audit(), BusMessage::AuditRecorded(Arc::clone(&entry)));

        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == AUDIT_RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(Arc::clone(&entry));
        }

        entry
    }

    /// Snapshot of the recent-entries ring, oldest first.
    pub fn recent(&self) -> Vec<Arc<AuditEntry>> {
        self.recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_sensitive_keys() {
        let args = json!({
            "sprite_id": "s1",
            "token": "sk-live-abc123",
            "nested": {
                "password": "hunter2",
                "depth": {"api_key": "xyz", "plain": 4}
            },
            "list": [{"secret": "shh"}, "ok"]
        });

        let clean = sanitize_args(&args);
        assert_eq!(clean["sprite_id"], json!("s1"));
        assert_eq!(clean["token"], json!(REDACTED));
        assert_eq!(clean["nested"]["password"], json!(REDACTED));
        assert_eq!(clean["nested"]["depth"]["api_key"], json!(REDACTED));
        assert_eq!(clean["nested"]["depth"]["plain"], json!(4));
        assert_eq!(clean["list"][0]["secret"], json!(REDACTED));
        assert_eq!(clean["list"][1], json!("ok"));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let args = json!({"token": "abc", "inner": {"key": "k"}});
        let once = sanitize_args(&args);
        let twice = sanitize_args(&once);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_record_publishes_on_audit_topic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&topics::audit());
        let log = AuditLog::new(bus);

        log.record(
            "sprites",
            "wake",
            Classification::Controlled,
            AuditResult::Ok,
            Actor::Operator("admin".to_string()),
            json!({"sprite_id": "s1", "token": "t"}),
            Some("admin".to_string()),
        );

        match rx.recv().await.unwrap() {
            BusMessage::AuditRecorded(entry) => {
                assert_eq!(entry.capability, "sprites");
                assert_eq!(entry.operation, "wake");
                assert_eq!(entry.args["token"], json!(REDACTED));
                assert_eq!(entry.args["sprite_id"], json!("s1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_recent_ring_is_bounded() {
        let log = AuditLog::new(EventBus::new());
        for i in 0..(AUDIT_RECENT_CAPACITY + 10) {
            log.record(
                "intents",
                "update",
                Classification::Safe,
                AuditResult::Ok,
                Actor::System,
                json!({"seq": i}),
                None,
            );
        }
        let recent = log.recent();
        assert_eq!(recent.len(), AUDIT_RECENT_CAPACITY);
        // Oldest entries were dropped
        assert_eq!(recent[0].args["seq"], json!(10));
    }
}
