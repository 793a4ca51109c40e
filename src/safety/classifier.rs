//! Safety classifier - maps (capability, operation) to a classification
//!
//! Pure lookup in a static table. Unknown operations default to
//! `controlled`: an operation nobody vetted must not slip through as safe.

use crate::intent::kinds::KindRegistry;
use crate::intent::model::Intent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Safety level of an operation or intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Read-only or otherwise harmless; auto-approved
    Safe,
    /// Mutates managed resources; admitted per policy, usually with approval
    Controlled,
    /// Externally visible or destructive; never auto-approved
    Dangerous,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Controlled => write!(f, "controlled"),
            Self::Dangerous => write!(f, "dangerous"),
        }
    }
}

/// A classified action, ready for the gate and the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub capability: String,
    pub operation: String,
    pub classification: Classification,
    pub args: Value,
}

/// The static classification table.
///
/// Everything read-only on the worker API is safe; lifecycle mutations are
/// controlled; deploy-surface and repo-mutating operations are dangerous.
fn table() -> &'static HashMap<(&'static str, &'static str), Classification> {
    static TABLE: OnceLock<HashMap<(&'static str, &'static str), Classification>> =
        OnceLock::new();
    TABLE.get_or_init(|| {
        use Classification::*;
        let mut t = HashMap::new();
        // Worker API
        t.insert(("sprites", "list_sprites"), Safe);
        t.insert(("sprites", "get_sprite"), Safe);
        t.insert(("sprites", "fetch_logs"), Safe);
        t.insert(("sprites", "wake"), Controlled);
        t.insert(("sprites", "sleep"), Controlled);
        t.insert(("sprites", "exec"), Controlled);
        t.insert(("sprites", "run_task"), Controlled);
        t.insert(("sprites", "destroy"), Dangerous);
        // Governance / GitHub surface
        t.insert(("github", "get_issue"), Safe);
        t.insert(("github", "list_issues"), Safe);
        t.insert(("github", "create_issue"), Controlled);
        t.insert(("github", "create_comment"), Controlled);
        t.insert(("github", "merge_pr"), Dangerous);
        t.insert(("github", "push"), Dangerous);
        // Deploy surface
        t.insert(("fly", "status"), Safe);
        t.insert(("fly", "deploy"), Dangerous);
        t.insert(("fly", "scale"), Dangerous);
        t.insert(("fly", "destroy"), Dangerous);
        // Secrets are never casually readable
        t.insert(("secrets", "get_secret"), Controlled);
        t
    })
}

/// Classify a capability operation. Unknown operations are `controlled`.
///
/// Returns the classification together with an [`ActionRecord`] carrying the
/// call arguments for the gate and the audit log.
pub fn classify(capability: &str, operation: &str, args: Value) -> (Classification, ActionRecord) {
    let classification = table()
        .get(&(capability, operation))
        .copied()
        .unwrap_or(Classification::Controlled);
    let record = ActionRecord {
        capability: capability.to_string(),
        operation: operation.to_string(),
        classification,
        args,
    };
    (classification, record)
}

/// Classify an intent.
///
/// A task-style action carrying `{capability, operation}` in its payload is
/// classified through the table; anything else falls back to its kind's
/// default classification (`maintenance → safe`, `inquiry → controlled`,
/// bare `action` → controlled, custom kinds per their registration).
pub fn classify_intent(intent: &Intent, registry: &KindRegistry) -> Classification {
    if intent.kind == "action" {
        if let Some((capability, operation)) = intent.capability_operation() {
            let (classification, _) =
                classify(capability, operation, Value::Object(intent.payload.clone()));
            return classification;
        }
    }
    registry
        .get(&intent.kind)
        .map(|spec| spec.default_classification)
        .unwrap_or(Classification::Controlled)
}
