//! Rollback proposer - drafts recovery intents for failures
//!
//! Subscribes to `intents:all`. When an intent enters `failed` and carries
//! a rollback strategy, a maintenance intent is proposed with
//! `rollback_for` pointing back at it, and the original gets
//! `metadata.rollback_intent_id` — a bidirectional link. Off by default;
//! enabled with `pipeline.auto_rollback`.

use super::model::{Intent, IntentOptions, IntentSource, IntentState, SourceType};
use super::pipeline::Pipeline;
use super::store::IntentPatch;
use crate::events::{topics, BusMessage, EventBus};
use serde_json::{json, Map};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Background task proposing rollbacks for failed intents.
pub struct RollbackProposer {
    pipeline: Pipeline,
    bus: EventBus,
}

impl RollbackProposer {
    pub fn new(pipeline: Pipeline, bus: EventBus) -> Self {
        Self { pipeline, bus }
    }

    /// Run until cancelled. Lagging behind the bus only costs missed
    /// failures; the proposer never blocks publishers.
    pub async fn run(self, cancel: CancellationToken) {
        let mut rx = self.bus.subscribe(&topics::intents_all());
        info!("Rollback proposer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(BusMessage::IntentState { state: IntentState::Failed, intent }) => {
                        self.handle_failure(&intent);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Rollback proposer lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Rollback proposer stopped");
    }

    fn handle_failure(&self, failed: &Intent) {
        let Some(strategy) = failed.rollback_strategy.clone() else {
            return;
        };
        if failed.metadata.contains_key("rollback_intent_id") {
            return;
        }

        let mut payload = Map::new();
        payload.insert("strategy".to_string(), json!(strategy));
        payload.insert("affected_resources".to_string(), json!(failed.affected_resources));

        let rollback = Intent::maintenance(
            IntentSource::new(SourceType::System, "auto-rollback"),
            format!("Roll back failed intent: {}", failed.summary),
            payload,
            IntentOptions { rollback_for: Some(failed.id.clone()), ..IntentOptions::default() },
        );
        let rollback = match rollback {
            Ok(intent) => intent,
            Err(e) => {
                warn!(intent_id = %failed.id, error = %e, "Could not build rollback intent");
                return;
            }
        };

        match self.pipeline.propose(rollback) {
            Ok(proposed) => {
                let mut merge = Map::new();
                merge.insert("rollback_intent_id".to_string(), json!(proposed.id));
                if let Err(e) = self.pipeline.store().update(
                    &failed.id,
                    IntentPatch { metadata_merge: Some(merge), ..IntentPatch::default() },
                ) {
                    warn!(intent_id = %failed.id, error = %e, "Could not link rollback intent");
                }
                info!(
                    failed_id = %failed.id,
                    rollback_id = %proposed.id,
                    "Rollback intent proposed"
                );
            }
            Err(e) => {
                warn!(intent_id = %failed.id, error = %e, "Failed to propose rollback intent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::intent::kinds::KindRegistry;
    use crate::intent::store::{IntentFilter, IntentStore};
    use crate::safety::audit::AuditLog;
    use std::sync::Arc;
    use std::time::Duration;

    fn fixture() -> (Pipeline, EventBus) {
        let bus = EventBus::new();
        let audit = AuditLog::new(bus.clone());
        let store = IntentStore::new(bus.clone(), audit);
        (Pipeline::new(store, Arc::new(KindRegistry::builtin())), bus)
    }

    fn failing_action(with_strategy: bool) -> Intent {
        let mut payload = Map::new();
        payload.insert("capability".to_string(), json!("sprites"));
        payload.insert("operation".to_string(), json!("list_sprites"));
        Intent::action(
            IntentSource::new(SourceType::Agent, "agent-1"),
            "migrate the tag schema",
            payload,
            vec!["store:tags".to_string()],
            vec!["tags rewritten".to_string()],
            IntentOptions {
                rollback_strategy: with_strategy
                    .then(|| "restore tags from the pre-migration snapshot".to_string()),
                ..IntentOptions::default()
            },
        )
        .unwrap()
    }

    async fn settle() {
        // Give the proposer task a few polls to drain the bus.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_failed_intent_with_strategy_gets_rollback() {
        let (pipeline, bus) = fixture();
        let cancel = CancellationToken::new();
        let proposer = RollbackProposer::new(pipeline.clone(), bus.clone());
        let task = tokio::spawn(proposer.run(cancel.clone()));
        settle().await; // let the proposer subscribe before anything publishes

        let intent = pipeline.propose(failing_action(true)).unwrap();
        pipeline.start(&intent.id, "executor").unwrap();
        pipeline.fail(&intent.id, "executor", Some("worker died".to_string()), None).unwrap();
        settle().await;

        let original = pipeline.store().get(&intent.id).unwrap();
        let rollback_id = original
            .metadata
            .get("rollback_intent_id")
            .and_then(|v| v.as_str())
            .expect("rollback link missing")
            .to_string();

        let rollback = pipeline.store().get(&rollback_id).unwrap();
        assert_eq!(rollback.kind, "maintenance");
        assert_eq!(rollback.rollback_for.as_deref(), Some(intent.id.as_str()));
        assert_eq!(rollback.source.source_type, SourceType::System);
        assert_eq!(rollback.source.id, "auto-rollback");
        assert_eq!(
            rollback.payload["strategy"],
            json!("restore tags from the pre-migration snapshot")
        );

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_failure_without_strategy_is_ignored() {
        let (pipeline, bus) = fixture();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(RollbackProposer::new(pipeline.clone(), bus.clone()).run(cancel.clone()));
        settle().await;

        let intent = pipeline.propose(failing_action(false)).unwrap();
        pipeline.start(&intent.id, "executor").unwrap();
        pipeline.fail(&intent.id, "executor", None, None).unwrap();
        settle().await;

        assert!(!pipeline
            .store()
            .get(&intent.id)
            .unwrap()
            .metadata
            .contains_key("rollback_intent_id"));
        // Only the original exists
        assert_eq!(pipeline.store().list(&IntentFilter::default()).len(), 1);

        cancel.cancel();
        let _ = task.await;
    }
}
