//! Intent kind registry - runtime-extensible kind table
//!
//! Each kind is a small record declaring its required payload fields and
//! default classification. Adding a kind never requires touching the
//! pipeline: the registry is consulted at classification and validation
//! time. Missing payload fields warn rather than reject, so pluggable
//! kinds cannot break existing intents.

use crate::safety::classifier::Classification;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::warn;

/// Declaration of one intent kind.
#[derive(Debug, Clone)]
pub struct KindSpec {
    pub name: String,
    pub description: String,
    pub required_payload_fields: Vec<String>,
    pub default_classification: Classification,
}

impl KindSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        required_payload_fields: &[&str],
        default_classification: Classification,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required_payload_fields: required_payload_fields
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            default_classification,
        }
    }
}

/// Result of validating a payload against its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadCheck {
    Ok,
    /// Fields the kind declares but the payload lacks. Logged, not fatal.
    Warn(Vec<String>),
}

/// Process-wide kind table. Registration happens at init; the table is
/// read-mostly afterwards.
#[derive(Default)]
pub struct KindRegistry {
    kinds: DashMap<String, KindSpec>,
}

impl KindRegistry {
    /// Registry pre-populated with the built-in kinds.
    pub fn builtin() -> Self {
        let registry = Self::default();
        registry.register(KindSpec::new(
            "action",
            "A concrete side effect with named resources and declared consequences",
            &["summary", "capability", "operation"],
            Classification::Controlled,
        ));
        registry.register(KindSpec::new(
            "inquiry",
            "A request for access or information",
            &["what_requested", "why_needed", "scope_of_impact", "expiration"],
            Classification::Controlled,
        ));
        registry.register(KindSpec::new(
            "maintenance",
            "Routine housekeeping proposed by the system or its operators",
            &[],
            Classification::Safe,
        ));
        registry
    }

    /// Register (or replace) a kind.
    pub fn register(&self, spec: KindSpec) {
        self.kinds.insert(spec.name.clone(), spec);
    }

    /// Look up a kind by name.
    pub fn get(&self, name: &str) -> Option<KindSpec> {
        self.kinds.get(name).map(|entry| entry.value().clone())
    }

    /// All registered kind names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.kinds.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Check a payload against the kind's declared required fields.
    ///
    /// Unknown kinds and missing fields both warn: the registry must never
    /// reject an intent another deployment's kinds produced.
    pub fn validate_payload(&self, kind: &str, payload: &Map<String, Value>) -> PayloadCheck {
        let Some(spec) = self.get(kind) else {
            warn!(kind = kind, "Unknown intent kind — accepting payload unchecked");
            return PayloadCheck::Ok;
        };

        let missing: Vec<String> = spec
            .required_payload_fields
            .iter()
            .filter(|field| !payload.contains_key(*field))
            .cloned()
            .collect();

        if missing.is_empty() {
            PayloadCheck::Ok
        } else {
            warn!(kind = kind, missing = ?missing, "Intent payload missing declared fields");
            PayloadCheck::Warn(missing)
        }
    }
}
