//! Run bridge - external run lifecycle to intent state
//!
//! The run executor publishes blocked/resumed notices on `runs:all`. When
//! a run is tied to an intent that is currently `running`, those notices
//! become `blocked` / `waiting_for_input` transitions and back. Everything
//! else on the topic is ignored silently.

use crate::events::{telemetry, topics, BusMessage, EventBus};
use crate::intent::model::IntentState;
use crate::intent::store::{IntentPatch, IntentStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status reported by the external run executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Blocked,
    BlockedWaitingForUser,
    Completed,
    Failed,
}

/// One run lifecycle event on `runs:all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub at: DateTime<Utc>,
}

/// Background task translating run events into intent transitions.
pub struct RunBridge {
    store: IntentStore,
    bus: EventBus,
}

impl RunBridge {
    pub fn new(store: IntentStore, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut rx = self.bus.subscribe(&topics::runs_all());
        info!("Run bridge started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(BusMessage::RunBlocked(run)) => self.handle_blocked(&run),
                    Ok(BusMessage::RunResumed(run)) => self.handle_resumed(&run),
                    Ok(_) => {} // not ours
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Run bridge lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Run bridge stopped");
    }

    fn handle_blocked(&self, run: &RunEvent) {
        let Some(intent_id) = run.intent_id.as_deref() else {
            return;
        };
        let Ok(intent) = self.store.get(intent_id) else {
            return;
        };
        if intent.state != IntentState::Running {
            debug!(intent_id = intent_id, state = %intent.state, "Ignoring blocked run: intent not running");
            return;
        }

        let patch = match run.status {
            RunStatus::Blocked => IntentPatch {
                state: Some(IntentState::Blocked),
                actor: Some("run-bridge".to_string()),
                reason: run.reason.clone(),
                blocked_reason: Some(run.reason.clone()),
                ..IntentPatch::default()
            },
            RunStatus::BlockedWaitingForUser => IntentPatch {
                state: Some(IntentState::WaitingForInput),
                actor: Some("run-bridge".to_string()),
                reason: Some("waiting for user input".to_string()),
                pending_question: Some(run.question.clone()),
                ..IntentPatch::default()
            },
            _ => return,
        };

        match self.store.update(intent_id, patch) {
            Ok(updated) => {
                telemetry::emit(
                    &["lattice", "intent", "blocked"],
                    json!({}),
                    json!({"id": intent_id, "run_id": run.run_id, "state": updated.state.to_string()}),
                );
            }
            Err(e) => warn!(intent_id = intent_id, error = %e, "Failed to block intent"),
        }
    }

    fn handle_resumed(&self, run: &RunEvent) {
        let Some(intent_id) = run.intent_id.as_deref() else {
            return;
        };
        let Ok(intent) = self.store.get(intent_id) else {
            return;
        };
        if !matches!(intent.state, IntentState::Blocked | IntentState::WaitingForInput) {
            return;
        }

        let patch = IntentPatch {
            state: Some(IntentState::Running),
            actor: Some("run-bridge".to_string()),
            reason: Some("run resumed".to_string()),
            blocked_reason: Some(None),
            pending_question: Some(None),
            ..IntentPatch::default()
        };

        match self.store.update(intent_id, patch) {
            Ok(_) => {
                telemetry::emit(
                    &["lattice", "intent", "resumed"],
                    json!({}),
                    json!({"id": intent_id, "run_id": run.run_id}),
                );
            }
            Err(e) => warn!(intent_id = intent_id, error = %e, "Failed to resume intent"),
        }
    }
}
