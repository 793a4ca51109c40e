//! Intent store - in-memory index with a single serialized write path
//!
//! All intent mutation flows through `update`, which enforces the lifecycle
//! state machine and the frozen-field rules, appends to the transition log,
//! emits telemetry, publishes bus messages, and records an audit entry —
//! all inside one lock section so the transition log mirrors emission
//! order. Nothing in here awaits; the lock is never held across a
//! suspension point.

use super::lifecycle;
use super::model::{Artifact, Intent, IntentState, Plan, SourceType, StepStatus, TransitionEntry};
use super::IntentError;
use crate::events::{telemetry, topics, BusMessage, EventBus};
use crate::safety::audit::{Actor, AuditLog, AuditResult};
use crate::safety::classifier::Classification;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ============================================================================
// Patch & filter
// ============================================================================

/// A partial update applied through the store. `None` fields are untouched.
/// The double-`Option` fields distinguish "leave alone" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct IntentPatch {
    /// Target lifecycle state; validated against the transition table
    pub state: Option<IntentState>,
    /// Actor recorded on the transition entry (defaults to `system`)
    pub actor: Option<String>,
    /// Reason recorded on the transition entry
    pub reason: Option<String>,

    pub summary: Option<String>,
    pub payload: Option<Map<String, Value>>,
    pub affected_resources: Option<Vec<String>>,
    pub expected_side_effects: Option<Vec<String>>,
    pub rollback_strategy: Option<Option<String>>,
    pub plan: Option<Plan>,
    pub classification: Option<Classification>,
    pub result: Option<Value>,
    /// Shallow-merged into `metadata`
    pub metadata_merge: Option<Map<String, Value>>,

    pub blocked_reason: Option<Option<String>>,
    pub pending_question: Option<Option<String>>,
}

impl IntentPatch {
    /// A pure state transition with actor and reason.
    pub fn transition(
        state: IntentState,
        actor: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            state: Some(state),
            actor: Some(actor.into()),
            reason,
            ..Self::default()
        }
    }

    fn touches_frozen_fields(&self) -> bool {
        self.payload.is_some()
            || self.affected_resources.is_some()
            || self.expected_side_effects.is_some()
            || self.rollback_strategy.is_some()
            || self.plan.is_some()
    }
}

/// Filter for `list`. All criteria are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct IntentFilter {
    pub kind: Option<String>,
    pub state: Option<IntentState>,
    pub source_type: Option<SourceType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl IntentFilter {
    fn matches(&self, intent: &Intent) -> bool {
        if let Some(kind) = &self.kind {
            if &intent.kind != kind {
                return false;
            }
        }
        if let Some(state) = self.state {
            if intent.state != state {
                return false;
            }
        }
        if let Some(source_type) = self.source_type {
            if intent.source.source_type != source_type {
                return false;
            }
        }
        if let Some(since) = self.since {
            if intent.inserted_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if intent.inserted_at > until {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Store
// ============================================================================

struct Stored {
    intent: Intent,
    /// Monotonic insertion sequence; tiebreaker for same-instant inserts
    seq: u64,
}

struct Inner {
    by_id: HashMap<String, Stored>,
    next_seq: u64,
}

/// The in-memory intent index. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct IntentStore {
    inner: Arc<Mutex<Inner>>,
    bus: EventBus,
    audit: AuditLog,
}

impl IntentStore {
    pub fn new(bus: EventBus, audit: AuditLog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { by_id: HashMap::new(), next_seq: 0 })),
            bus,
            audit,
        }
    }

    /// Persist a new intent. Fails with `AlreadyExists` on a duplicate id.
    pub fn create(&self, intent: Intent) -> Result<Intent, IntentError> {
        let mut inner = self.lock();
        if inner.by_id.contains_key(&intent.id) {
            return Err(IntentError::AlreadyExists(intent.id));
        }

        let stored = intent.clone();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_id.insert(intent.id.clone(), Stored { intent, seq });

        let shared = Arc::new(stored.clone());
        telemetry::emit(
            &["lattice", "intent", "created"],
            json!({}),
            json!({"id": shared.id, "kind": shared.kind}),
        );
        self.publish_intent(&shared.id, BusMessage::IntentCreated(Arc::clone(&shared)));
        self.publish_intent(
            &shared.id,
            BusMessage::IntentState { state: IntentState::Proposed, intent: Arc::clone(&shared) },
        );
        self.audit_mutation("create", &shared.id, AuditResult::Ok, None);

        Ok(stored)
    }

    /// Fetch one intent by id.
    pub fn get(&self, id: &str) -> Result<Intent, IntentError> {
        self.lock()
            .by_id
            .get(id)
            .map(|s| s.intent.clone())
            .ok_or_else(|| IntentError::NotFound(id.to_string()))
    }

    /// List intents matching `filter`, sorted by insertion order ascending.
    pub fn list(&self, filter: &IntentFilter) -> Vec<Intent> {
        let inner = self.lock();
        let mut matched: Vec<&Stored> = inner
            .by_id
            .values()
            .filter(|s| filter.matches(&s.intent))
            .collect();
        matched.sort_by_key(|s| (s.intent.inserted_at, s.seq));
        let take = filter.limit.unwrap_or(usize::MAX);
        matched.into_iter().take(take).map(|s| s.intent.clone()).collect()
    }

    /// Ordered transition log for one intent.
    pub fn get_history(&self, id: &str) -> Result<Vec<TransitionEntry>, IntentError> {
        self.get(id).map(|intent| intent.transition_log)
    }

    /// Count of stored intents per lifecycle state.
    pub fn counts_by_state(&self) -> HashMap<IntentState, usize> {
        let inner = self.lock();
        let mut counts = HashMap::new();
        for stored in inner.by_id.values() {
            *counts.entry(stored.intent.state).or_insert(0) += 1;
        }
        counts
    }

    /// Apply a patch. Drives the lifecycle checker when `patch.state` is
    /// set, enforces frozen-field rules, refreshes `updated_at`, and emits
    /// the transition messages.
    pub fn update(&self, id: &str, patch: IntentPatch) -> Result<Intent, IntentError> {
        let mut inner = self.lock();
        let stored = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| IntentError::NotFound(id.to_string()))?;
        let intent = &mut stored.intent;

        // Validation before any mutation: a rejected patch leaves the
        // intent untouched.
        if intent.is_frozen() && patch.touches_frozen_fields() {
            self.audit_mutation("update", id, AuditResult::Denied, Some("immutable"));
            return Err(IntentError::Immutable);
        }
        if patch.classification.is_some() && intent.classification.is_some() {
            return Err(IntentError::AlreadyClassified);
        }
        let transition = match patch.state {
            Some(to) => {
                lifecycle::check(intent.state, to)?;
                Some((intent.state, to))
            }
            None => None,
        };

        let now = Utc::now();

        if let Some(summary) = patch.summary {
            intent.summary = summary;
        }
        if let Some(payload) = patch.payload {
            intent.payload = payload;
        }
        if let Some(resources) = patch.affected_resources {
            intent.affected_resources = resources;
        }
        if let Some(effects) = patch.expected_side_effects {
            intent.expected_side_effects = effects;
        }
        if let Some(strategy) = patch.rollback_strategy {
            intent.rollback_strategy = strategy;
        }
        if let Some(plan) = patch.plan {
            intent.plan = Some(plan);
        }
        if let Some(classification) = patch.classification {
            intent.classification = Some(classification);
        }
        if let Some(result) = patch.result {
            intent.result = Some(result);
        }
        if let Some(merge) = patch.metadata_merge {
            for (k, v) in merge {
                intent.metadata.insert(k, v);
            }
        }
        if let Some(blocked_reason) = patch.blocked_reason {
            intent.blocked_reason = blocked_reason;
        }
        if let Some(pending_question) = patch.pending_question {
            intent.pending_question = pending_question;
        }

        if let Some((from, to)) = transition {
            intent.state = to;
            match to {
                IntentState::Classified => intent.classified_at = Some(now),
                IntentState::Approved => intent.approved_at = Some(now),
                IntentState::Blocked => intent.blocked_at = Some(now),
                IntentState::Running
                    if matches!(from, IntentState::Blocked | IntentState::WaitingForInput) =>
                {
                    intent.resumed_at = Some(now);
                }
                _ => {}
            }
            intent.transition_log.push(TransitionEntry {
                from,
                to,
                actor: patch.actor.unwrap_or_else(|| "system".to_string()),
                reason: patch.reason,
                timestamp: now,
            });
        }
        intent.updated_at = now;

        let snapshot = Arc::new(intent.clone());
        if let Some((from, to)) = transition {
            telemetry::emit(
                &["lattice", "intent", "transitioned"],
                json!({}),
                json!({
                    "id": snapshot.id,
                    "from": from.to_string(),
                    "to": to.to_string(),
                }),
            );
            self.publish_intent(id, BusMessage::IntentTransitioned(Arc::clone(&snapshot)));
            self.publish_intent(
                id,
                BusMessage::IntentState { state: to, intent: Arc::clone(&snapshot) },
            );
        }
        self.audit_mutation("update", id, AuditResult::Ok, None);

        Ok((*snapshot).clone())
    }

    /// Update one plan step's status. Allowed even when the plan structure
    /// is frozen; bumps the plan version and re-renders its markdown.
    pub fn update_plan_step(
        &self,
        id: &str,
        step_id: &str,
        status: StepStatus,
        output: Option<Value>,
    ) -> Result<Intent, IntentError> {
        let mut inner = self.lock();
        let stored = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| IntentError::NotFound(id.to_string()))?;
        let intent = &mut stored.intent;

        let plan = intent.plan.as_mut().ok_or(IntentError::NoPlan)?;
        plan.set_step_status(step_id, status, output)?;
        intent.updated_at = Utc::now();

        telemetry::emit(
            &["lattice", "intent", "plan_step"],
            json!({"version": intent.plan.as_ref().map_or(0, |p| p.version)}),
            json!({"id": id, "step_id": step_id, "status": format!("{status:?}").to_lowercase()}),
        );
        self.audit_mutation("update_plan_step", id, AuditResult::Ok, None);

        Ok(intent.clone())
    }

    /// Append an artifact under `metadata.artifacts`.
    pub fn add_artifact(&self, id: &str, artifact: Artifact) -> Result<Intent, IntentError> {
        let mut inner = self.lock();
        let stored = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| IntentError::NotFound(id.to_string()))?;
        let intent = &mut stored.intent;

        let artifact_value = serde_json::to_value(&artifact)
            .unwrap_or_else(|_| json!({"type": artifact.artifact_type}));
        match intent.metadata.get_mut("artifacts") {
            Some(Value::Array(items)) => items.push(artifact_value),
            _ => {
                intent
                    .metadata
                    .insert("artifacts".to_string(), Value::Array(vec![artifact_value]));
            }
        }
        intent.updated_at = Utc::now();

        let snapshot = Arc::new(intent.clone());
        telemetry::emit(
            &["lattice", "intent", "artifact_added"],
            json!({}),
            json!({"id": id, "artifact_type": artifact.artifact_type}),
        );
        self.publish_intent(
            id,
            BusMessage::IntentArtifactAdded { intent: Arc::clone(&snapshot), artifact },
        );
        self.audit_mutation("add_artifact", id, AuditResult::Ok, None);

        Ok((*snapshot).clone())
    }

    fn publish_intent(&self, id: &str, message: BusMessage) {
        self.bus.publish(&topics::intents_all(), message.clone());
        self.bus.publish(&topics::intent(id), message);
    }

    fn audit_mutation(&self, operation: &str, id: &str, result: AuditResult, note: Option<&str>) {
        let mut args = json!({"id": id});
        if let Some(note) = note {
            args["note"] = json!(note);
        }
        self.audit.record(
            "intents",
            operation,
            Classification::Safe,
            result,
            Actor::System,
            args,
            None,
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned store mutex means a bug already panicked mid-write;
        // recovering the guard keeps the control plane serving reads.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
