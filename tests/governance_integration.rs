//! Governance Integration Tests
//!
//! The full human-in-the-loop loop with the stub tracker: a controlled
//! intent is mirrored to an issue, an approve label drives the approval,
//! the run executor blocks and resumes it, and completion closes the issue.

use lattice::bridge::{GovernanceBridge, RunBridge, RunEvent, RunStatus};
use lattice::capabilities::issues::{IssueTracker, StubIssueTracker};
use lattice::events::{topics, BusMessage, EventBus};
use lattice::intent::kinds::KindRegistry;
use lattice::intent::model::{Intent, IntentOptions, IntentSource, SourceType};
use lattice::intent::store::IntentStore;
use lattice::intent::{IntentState, Pipeline};
use lattice::safety::AuditLog;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

#[tokio::test]
async fn test_full_hitl_lifecycle() {
    let bus = EventBus::new();
    let audit = AuditLog::new(bus.clone());
    let store = IntentStore::new(bus.clone(), audit);
    let pipeline = Pipeline::new(store.clone(), Arc::new(KindRegistry::builtin()));
    let tracker = Arc::new(StubIssueTracker::new());

    let cancel = CancellationToken::new();
    tokio::spawn(
        GovernanceBridge::new(
            pipeline.clone(),
            Arc::clone(&tracker) as Arc<dyn IssueTracker>,
            bus.clone(),
        )
        .with_sync_interval(Duration::from_millis(30))
        .run(cancel.clone()),
    );
    tokio::spawn(RunBridge::new(store.clone(), bus.clone()).run(cancel.clone()));
    settle().await;

    // A controlled action lands in the approval queue and gets an issue.
    let mut payload = Map::new();
    payload.insert("capability".to_string(), json!("sprites"));
    payload.insert("operation".to_string(), json!("exec"));
    let intent = Intent::action(
        IntentSource::new(SourceType::Agent, "agent-3"),
        "run the database migration on sprite-2",
        payload,
        vec!["sprite:sprite-2".to_string(), "db:orders".to_string()],
        vec!["schema version bumped".to_string()],
        IntentOptions {
            rollback_strategy: Some("restore from the pre-migration snapshot".to_string()),
            ..IntentOptions::default()
        },
    )
    .unwrap();
    let intent = pipeline.propose(intent).unwrap();
    assert_eq!(intent.state, IntentState::AwaitingApproval);
    settle().await;

    let number = store.get(&intent.id).unwrap().governance_issue().expect("issue opened");
    let issue = tracker.get_issue(number).await.unwrap();
    assert!(issue.body.contains("db:orders"));
    assert!(issue.body.contains("restore from the pre-migration snapshot"));

    // A human applies the approve label; the sync drives the transition.
    tracker.add_label(number, "lattice:approve").await.unwrap();
    settle().await;
    settle().await;
    assert_eq!(store.get(&intent.id).unwrap().state, IntentState::Approved);

    // The executor picks it up, hits a prompt, resumes, and finishes.
    pipeline.start(&intent.id, "executor").unwrap();
    bus.publish(
        &topics::runs_all(),
        BusMessage::RunBlocked(Arc::new(RunEvent {
            run_id: "run_42".to_string(),
            intent_id: Some(intent.id.clone()),
            status: RunStatus::BlockedWaitingForUser,
            reason: None,
            question: Some("apply destructive step 3?".to_string()),
            at: chrono::Utc::now(),
        })),
    );
    settle().await;
    let waiting = store.get(&intent.id).unwrap();
    assert_eq!(waiting.state, IntentState::WaitingForInput);
    assert_eq!(waiting.pending_question.as_deref(), Some("apply destructive step 3?"));

    bus.publish(
        &topics::runs_all(),
        BusMessage::RunResumed(Arc::new(RunEvent {
            run_id: "run_42".to_string(),
            intent_id: Some(intent.id.clone()),
            status: RunStatus::Running,
            reason: None,
            question: None,
            at: chrono::Utc::now(),
        })),
    );
    settle().await;
    assert_eq!(store.get(&intent.id).unwrap().state, IntentState::Running);

    pipeline.complete(&intent.id, "executor", Some(json!({"applied": 12}))).unwrap();
    settle().await;

    // Terminal state closed the issue with an outcome comment.
    let issue = tracker.get_issue(number).await.unwrap();
    assert_eq!(issue.state, "closed");
    assert!(issue.comments.iter().any(|c| c.body.contains("completed")));

    cancel.cancel();
}

#[tokio::test]
async fn test_stale_label_after_local_decision_is_noop() {
    let bus = EventBus::new();
    let audit = AuditLog::new(bus.clone());
    let store = IntentStore::new(bus.clone(), audit);
    let pipeline = Pipeline::new(store.clone(), Arc::new(KindRegistry::builtin()));
    let tracker = Arc::new(StubIssueTracker::new());

    let cancel = CancellationToken::new();
    tokio::spawn(
        GovernanceBridge::new(
            pipeline.clone(),
            Arc::clone(&tracker) as Arc<dyn IssueTracker>,
            bus.clone(),
        )
        .with_sync_interval(Duration::from_millis(30))
        .run(cancel.clone()),
    );
    settle().await;

    let mut payload = Map::new();
    payload.insert("capability".to_string(), json!("sprites"));
    payload.insert("operation".to_string(), json!("wake"));
    let intent = pipeline
        .propose(
            Intent::action(
                IntentSource::new(SourceType::Operator, "cli"),
                "wake sprite-4",
                payload,
                vec!["sprite:sprite-4".to_string()],
                vec!["sprite wakes".to_string()],
                IntentOptions::default(),
            )
            .unwrap(),
        )
        .unwrap();
    settle().await;
    let number = store.get(&intent.id).unwrap().governance_issue().unwrap();

    // Operator cancels locally before anyone touches the issue.
    pipeline.cancel(&intent.id, "operator", Some("no longer needed".to_string())).unwrap();
    settle().await;
    assert_eq!(tracker.get_issue(number).await.unwrap().state, "closed");

    // A label applied afterwards must not resurrect the intent.
    tracker.add_label(number, "lattice:approve").await.unwrap();
    settle().await;
    settle().await;
    assert_eq!(store.get(&intent.id).unwrap().state, IntentState::Canceled);

    cancel.cancel();
}
