//! Intent pipeline - propose → classify → gate → approve | await approval
//!
//! The pipeline is the only public entry point for getting an intent into
//! the system. Collaborators (sprites, the ambient responder, operators,
//! cron jobs) construct an intent and hand it to `propose`; everything
//! after that is policy.

use super::kinds::KindRegistry;
use super::model::{Intent, IntentState};
use super::store::{IntentPatch, IntentStore};
use super::IntentError;
use crate::config::{GuardrailsConfig, TaskAllowlistConfig};
use crate::events::telemetry;
use crate::safety::{classifier, gate};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// The classify-gate-approve pipeline. Cheap to clone.
///
/// Policy (guardrails + task allowlist) is snapshotted at construction;
/// registration-time wiring, not hot-swapped state.
#[derive(Clone)]
pub struct Pipeline {
    store: IntentStore,
    registry: Arc<KindRegistry>,
    guardrails: GuardrailsConfig,
    allowlist: TaskAllowlistConfig,
}

impl Pipeline {
    /// Pipeline using the deployment's configured policy.
    pub fn new(store: IntentStore, registry: Arc<KindRegistry>) -> Self {
        let config = crate::config::get();
        Self::with_policy(
            store,
            registry,
            config.guardrails.clone(),
            config.task_allowlist.clone(),
        )
    }

    /// Pipeline with explicit policy, for tests and embedders.
    pub fn with_policy(
        store: IntentStore,
        registry: Arc<KindRegistry>,
        guardrails: GuardrailsConfig,
        allowlist: TaskAllowlistConfig,
    ) -> Self {
        Self { store, registry, guardrails, allowlist }
    }

    pub fn store(&self) -> &IntentStore {
        &self.store
    }

    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// Propose an intent: persist, classify, and gate it. Returns the
    /// intent in its post-gate state (`approved` or `awaiting_approval`).
    ///
    /// A gate decision of `not_permitted` still lands in
    /// `awaiting_approval` so a human can override policy; the transition
    /// reason records that policy denied it.
    pub fn propose(&self, intent: Intent) -> Result<Intent, IntentError> {
        let intent = self.store.create(intent)?;
        let id = intent.id.clone();

        // Missing declared payload fields warn without rejecting.
        self.registry.validate_payload(&intent.kind, &intent.payload);

        let classification = classifier::classify_intent(&intent, &self.registry);
        let intent = self.store.update(
            &id,
            IntentPatch {
                classification: Some(classification),
                state: Some(IntentState::Classified),
                actor: Some("system".to_string()),
                reason: Some(format!("classified as {classification}")),
                ..IntentPatch::default()
            },
        )?;
        telemetry::emit(
            &["lattice", "intent", "classified"],
            json!({}),
            json!({"id": id, "classification": classification.to_string()}),
        );

        let outcome =
            gate::check_intent(&intent, classification, &self.guardrails, &self.allowlist);

        let target = match outcome.decision {
            gate::GateDecision::Allow => IntentState::Approved,
            gate::GateDecision::ApprovalRequired | gate::GateDecision::NotPermitted => {
                IntentState::AwaitingApproval
            }
        };
        let updated = self.store.update(
            &id,
            IntentPatch::transition(target, "system", Some(outcome.reason.to_string())),
        )?;

        telemetry::emit(
            &["lattice", "intent", &updated.state.to_string()],
            json!({}),
            json!({"id": id, "gate": outcome.decision.to_string()}),
        );
        info!(
            intent_id = %id,
            kind = %updated.kind,
            classification = %classification,
            state = %updated.state,
            "Intent proposed"
        );

        Ok(updated)
    }

    /// Approve an awaiting intent on behalf of `actor`.
    pub fn approve(
        &self,
        id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Intent, IntentError> {
        self.drive(id, IntentState::Approved, actor, reason)
    }

    /// Reject an awaiting intent.
    pub fn reject(
        &self,
        id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Intent, IntentError> {
        self.drive(id, IntentState::Rejected, actor, reason)
    }

    /// Cancel an intent from any cancelable state.
    pub fn cancel(
        &self,
        id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Intent, IntentError> {
        self.drive(id, IntentState::Canceled, actor, reason)
    }

    /// Mark an approved intent as running (driven by the run executor).
    pub fn start(&self, id: &str, actor: &str) -> Result<Intent, IntentError> {
        self.drive(id, IntentState::Running, actor, None)
    }

    /// Mark a running intent completed, recording its result.
    pub fn complete(
        &self,
        id: &str,
        actor: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Intent, IntentError> {
        self.store.update(
            id,
            IntentPatch {
                state: Some(IntentState::Completed),
                actor: Some(actor.to_string()),
                result,
                ..IntentPatch::default()
            },
        )
    }

    /// Mark a running intent failed, recording the failure.
    pub fn fail(
        &self,
        id: &str,
        actor: &str,
        reason: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<Intent, IntentError> {
        self.store.update(
            id,
            IntentPatch {
                state: Some(IntentState::Failed),
                actor: Some(actor.to_string()),
                reason,
                result,
                ..IntentPatch::default()
            },
        )
    }

    fn drive(
        &self,
        id: &str,
        target: IntentState,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Intent, IntentError> {
        let updated = self.store.update(id, IntentPatch::transition(target, actor, reason))?;
        telemetry::emit(
            &["lattice", "intent", &target.to_string()],
            json!({}),
            json!({"id": id, "actor": actor}),
        );
        debug!(intent_id = %id, state = %target, actor = %actor, "Intent driven");
        Ok(updated)
    }
}
