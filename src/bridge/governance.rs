//! Governance bridge - human-in-the-loop approval through an issue tracker
//!
//! Every intent that reaches `awaiting_approval` gets a mirrored issue with
//! a structured body and a traceability footer. A periodic sync reads the
//! issue back: the approve/reject labels are authoritative over the
//! `awaiting_approval → approved | rejected` transition, and new comments
//! are captured onto the intent. Terminal transitions close the issue with
//! an outcome comment. The bridge never mutates frozen intent fields, and
//! once the local state has moved past `awaiting_approval` the sync is a
//! no-op. Tracker failures log a warning and wait for the next tick.

use crate::capabilities::issues::{IssueTracker, NewIssue};
use crate::events::{topics, BusMessage, EventBus};
use crate::intent::model::{Intent, IntentState};
use crate::intent::pipeline::Pipeline;
use crate::intent::store::{IntentFilter, IntentPatch};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label applied to every issue the bridge opens.
const BRIDGE_LABEL: &str = "lattice";

/// Background task mirroring approval state between intents and issues.
pub struct GovernanceBridge {
    pipeline: Pipeline,
    issues: Arc<dyn IssueTracker>,
    bus: EventBus,
    sync_interval: Duration,
    approve_label: String,
    reject_label: String,
}

impl GovernanceBridge {
    pub fn new(pipeline: Pipeline, issues: Arc<dyn IssueTracker>, bus: EventBus) -> Self {
        let config = &crate::config::get().governance;
        Self {
            pipeline,
            issues,
            bus,
            sync_interval: Duration::from_millis(config.sync_interval_ms),
            approve_label: config.approve_label.clone(),
            reject_label: config.reject_label.clone(),
        }
    }

    /// Override the sync cadence (tests).
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut rx = self.bus.subscribe(&topics::intents_all());
        let mut next_sync = tokio::time::Instant::now() + self.sync_interval;
        info!(sync_ms = self.sync_interval.as_millis() as u64, "Governance bridge started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(BusMessage::IntentState { state, intent }) => {
                        self.handle_state(state, &intent).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Governance bridge lagged — next sync will catch up");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::time::sleep_until(next_sync) => {
                    self.sync_awaiting().await;
                    next_sync = tokio::time::Instant::now() + self.sync_interval;
                }
            }
        }

        info!("Governance bridge stopped");
    }

    async fn handle_state(&self, state: IntentState, intent: &Intent) {
        match state {
            IntentState::AwaitingApproval => self.open_issue(intent).await,
            s if s.is_terminal() => self.close_issue(intent).await,
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Issue creation
    // ------------------------------------------------------------------

    async fn open_issue(&self, intent: &Intent) {
        if intent.governance_issue().is_some() {
            return; // already mirrored
        }

        let title = format!("[lattice] Approval requested: {}", intent.summary);
        let body = self.format_issue_body(intent);
        let new_issue = NewIssue {
            body,
            labels: vec![BRIDGE_LABEL.to_string(), "needs-approval".to_string()],
        };

        match self.issues.create_issue(&title, new_issue).await {
            Ok(issue) => {
                info!(intent_id = %intent.id, issue = issue.number, "Governance issue opened");
                let mut merge = Map::new();
                merge.insert("governance_issue".to_string(), json!(issue.number));
                if let Err(e) = self.pipeline.store().update(
                    &intent.id,
                    IntentPatch { metadata_merge: Some(merge), ..IntentPatch::default() },
                ) {
                    warn!(intent_id = %intent.id, error = %e, "Could not record governance issue");
                }
            }
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "Failed to open governance issue — next sync retries");
            }
        }
    }

    fn format_issue_body(&self, intent: &Intent) -> String {
        let mut body = String::new();
        body.push_str(&format!("## Summary\n{}\n\n", intent.summary));
        body.push_str(&format!(
            "**Classification:** {}\n**Kind:** {}\n**Source:** {} ({})\n\n",
            intent
                .classification
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unclassified".to_string()),
            intent.kind,
            intent.source.source_type,
            intent.source.id,
        ));
        body.push_str(&format!(
            "## Payload\n```json\n{}\n```\n\n",
            serde_json::to_string_pretty(&intent.payload).unwrap_or_else(|_| "{}".to_string())
        ));
        body.push_str("## Affected resources\n");
        for resource in &intent.affected_resources {
            body.push_str(&format!("- {resource}\n"));
        }
        body.push_str("\n## Expected side effects\n");
        for effect in &intent.expected_side_effects {
            body.push_str(&format!("- {effect}\n"));
        }
        if let Some(strategy) = &intent.rollback_strategy {
            body.push_str(&format!("\n## Rollback strategy\n{strategy}\n"));
        }
        if let Some(plan) = &intent.plan {
            body.push_str(&format!("\n{}\n", plan.rendered_markdown));
        }
        body.push_str(&format!(
            "\n---\nApply the `{}` label to approve or `{}` to reject.\n\n<!-- lattice-intent:{} -->\n",
            self.approve_label, self.reject_label, intent.id
        ));
        body
    }

    // ------------------------------------------------------------------
    // Label sync
    // ------------------------------------------------------------------

    async fn sync_awaiting(&self) {
        let awaiting = self.pipeline.store().list(&IntentFilter {
            state: Some(IntentState::AwaitingApproval),
            ..IntentFilter::default()
        });

        for intent in awaiting {
            let Some(number) = intent.governance_issue() else {
                // Issue creation failed earlier; retry it now.
                self.open_issue(&intent).await;
                continue;
            };

            let issue = match self.issues.get_issue(number).await {
                Ok(issue) => issue,
                Err(e) => {
                    warn!(intent_id = %intent.id, issue = number, error = %e, "Governance sync fetch failed");
                    continue;
                }
            };

            // Capture human comments regardless of label state.
            if !issue.comments.is_empty() {
                let comments: Vec<_> = issue
                    .comments
                    .iter()
                    .map(|c| json!({"author": c.author, "body": c.body, "created_at": c.created_at}))
                    .collect();
                let mut merge = Map::new();
                merge.insert("github_comments".to_string(), json!(comments));
                let _ = self.pipeline.store().update(
                    &intent.id,
                    IntentPatch { metadata_merge: Some(merge), ..IntentPatch::default() },
                );
            }

            let approved = issue.labels.iter().any(|l| l == &self.approve_label);
            let rejected = issue.labels.iter().any(|l| l == &self.reject_label);

            let result = if approved {
                self.pipeline
                    .approve(
                        &intent.id,
                        "governance",
                        Some(format!("approved via issue #{number} label")),
                    )
                    .map(|_| "approved")
            } else if rejected {
                self.pipeline
                    .reject(
                        &intent.id,
                        "governance",
                        Some(format!("rejected via issue #{number} label")),
                    )
                    .map(|_| "rejected")
            } else {
                continue;
            };

            match result {
                Ok(outcome) => {
                    info!(intent_id = %intent.id, issue = number, outcome = outcome, "Governance label applied");
                }
                Err(e) => {
                    // The intent moved on between list and drive; the
                    // terminal handler owns it now.
                    debug!(intent_id = %intent.id, error = %e, "Governance sync no-op");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Terminal handling
    // ------------------------------------------------------------------

    async fn close_issue(&self, intent: &Intent) {
        let Some(number) = intent.governance_issue() else {
            return;
        };

        let duration_secs = (intent.updated_at - intent.inserted_at).num_seconds();
        let mut comment = format!(
            "**Outcome:** {}\n**Duration:** {}s\n",
            intent.state, duration_secs
        );
        if let Some(result) = &intent.result {
            comment.push_str(&format!(
                "\n```json\n{}\n```\n",
                serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
            ));
        }
        if let Some(entry) = intent.transition_log.last() {
            if let Some(reason) = &entry.reason {
                comment.push_str(&format!("\n_{}_\n", reason));
            }
        }

        if let Err(e) = self.issues.create_comment(number, &comment).await {
            warn!(issue = number, error = %e, "Failed to post outcome comment");
        }
        if intent.state == IntentState::Rejected {
            if let Err(e) = self.issues.add_label(number, &self.reject_label).await {
                warn!(issue = number, error = %e, "Failed to add rejection label");
            }
        }
        if let Err(e) = self.issues.update_issue(number, Some("closed")).await {
            warn!(issue = number, error = %e, "Failed to close governance issue");
        } else {
            info!(intent_id = %intent.id, issue = number, state = %intent.state, "Governance issue closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::issues::StubIssueTracker;
    use crate::events::EventBus;
    use crate::intent::kinds::KindRegistry;
    use crate::intent::model::{IntentOptions, IntentSource, SourceType};
    use crate::intent::store::IntentStore;
    use crate::safety::audit::AuditLog;

    fn fixture() -> (Pipeline, EventBus, Arc<StubIssueTracker>) {
        let bus = EventBus::new();
        let audit = AuditLog::new(bus.clone());
        let store = IntentStore::new(bus.clone(), audit);
        let pipeline = Pipeline::new(store, Arc::new(KindRegistry::builtin()));
        (pipeline, bus, Arc::new(StubIssueTracker::new()))
    }

    fn controlled_intent() -> Intent {
        let mut payload = Map::new();
        payload.insert("capability".to_string(), json!("sprites"));
        payload.insert("operation".to_string(), json!("wake"));
        Intent::action(
            IntentSource::new(SourceType::Agent, "agent-1"),
            "wake sprite-7 for the nightly task",
            payload,
            vec!["sprite:sprite-7".to_string()],
            vec!["sprite wakes".to_string()],
            IntentOptions::default(),
        )
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    fn spawn_bridge(
        pipeline: &Pipeline,
        bus: &EventBus,
        tracker: &Arc<StubIssueTracker>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let bridge = GovernanceBridge::new(
            pipeline.clone(),
            Arc::clone(tracker) as Arc<dyn IssueTracker>,
            bus.clone(),
        )
        .with_sync_interval(Duration::from_millis(30));
        tokio::spawn(bridge.run(cancel.clone()));
        cancel
    }

    #[tokio::test]
    async fn test_awaiting_intent_opens_issue() {
        let (pipeline, bus, tracker) = fixture();
        let cancel = spawn_bridge(&pipeline, &bus, &tracker);
        settle().await;

        let intent = pipeline.propose(controlled_intent()).unwrap();
        assert_eq!(intent.state, IntentState::AwaitingApproval);
        settle().await;

        let stored = pipeline.store().get(&intent.id).unwrap();
        let number = stored.governance_issue().expect("issue number recorded");
        let issue = tracker.get_issue(number).await.unwrap();
        assert!(issue.title.contains("wake sprite-7"));
        assert!(issue.body.contains(&format!("<!-- lattice-intent:{} -->", intent.id)));
        assert!(issue.body.contains("## Affected resources"));
        assert!(issue.labels.contains(&"needs-approval".to_string()));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_approve_label_drives_approval() {
        let (pipeline, bus, tracker) = fixture();
        let cancel = spawn_bridge(&pipeline, &bus, &tracker);
        settle().await;

        let intent = pipeline.propose(controlled_intent()).unwrap();
        settle().await;
        let number = pipeline.store().get(&intent.id).unwrap().governance_issue().unwrap();

        tracker.add_human_comment(number, "admin", "ship it");
        tracker.add_label(number, "lattice:approve").await.unwrap();
        settle().await;
        settle().await;

        let approved = pipeline.store().get(&intent.id).unwrap();
        assert_eq!(approved.state, IntentState::Approved);
        let last = approved.transition_log.last().unwrap();
        assert_eq!(last.actor, "governance");
        assert!(last.reason.as_deref().unwrap().contains(&format!("issue #{number}")));
        // Comments were captured
        assert!(approved.metadata.contains_key("github_comments"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_reject_label_drives_rejection_and_closes() {
        let (pipeline, bus, tracker) = fixture();
        let cancel = spawn_bridge(&pipeline, &bus, &tracker);
        settle().await;

        let intent = pipeline.propose(controlled_intent()).unwrap();
        settle().await;
        let number = pipeline.store().get(&intent.id).unwrap().governance_issue().unwrap();

        tracker.add_label(number, "lattice:reject").await.unwrap();
        settle().await;
        settle().await;

        let rejected = pipeline.store().get(&intent.id).unwrap();
        assert_eq!(rejected.state, IntentState::Rejected);

        let issue = tracker.get_issue(number).await.unwrap();
        assert_eq!(issue.state, "closed");
        assert!(issue.labels.contains(&"lattice:reject".to_string()));
        assert!(issue.comments.iter().any(|c| c.body.contains("rejected")));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_completed_intent_closes_issue_with_outcome() {
        let (pipeline, bus, tracker) = fixture();
        let cancel = spawn_bridge(&pipeline, &bus, &tracker);
        settle().await;

        let intent = pipeline.propose(controlled_intent()).unwrap();
        settle().await;
        let number = pipeline.store().get(&intent.id).unwrap().governance_issue().unwrap();

        pipeline.approve(&intent.id, "admin", None).unwrap();
        pipeline.start(&intent.id, "executor").unwrap();
        pipeline.complete(&intent.id, "executor", Some(json!({"exit_code": 0}))).unwrap();
        settle().await;

        let issue = tracker.get_issue(number).await.unwrap();
        assert_eq!(issue.state, "closed");
        assert!(issue.comments.iter().any(|c| c.body.contains("completed")));

        cancel.cancel();
    }
}
