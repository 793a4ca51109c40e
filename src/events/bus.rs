//! Topic pub/sub - named topics, typed messages, per-topic FIFO fan-out
//!
//! Every topic is backed by a tokio broadcast channel. Publishing never
//! blocks and never fails: with no subscribers the message is dropped, and
//! a subscriber that lags past the channel capacity is disconnected rather
//! than slowing the publisher. Within one topic, each subscriber observes
//! messages in publish order; there is no cross-topic ordering.

use crate::bridge::runs::RunEvent;
use crate::exec::protocol::ProtocolEvent;
use crate::exec::session::ExecOutput;
use crate::fleet::FleetSummary;
use crate::intent::model::{Artifact, Intent, IntentState};
use crate::safety::audit::AuditEntry;
use crate::sprite::state::{HealthUpdate, ReconcileResult, StateChange};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::defaults::BUS_TOPIC_CAPACITY;

// ============================================================================
// Messages
// ============================================================================

/// Which stream a unified log line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// A unified log line on `sprite:<id>:logs`, from exec sessions and the
/// worker API alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub sprite_id: String,
    /// Originator, e.g. `exec:<session_id>` or `api`
    pub source: String,
    pub stream: LogStream,
    pub line: String,
    pub at: DateTime<Utc>,
}

/// Tagged message delivered on bus topics. One subscriber can multiplex
/// several topics and dispatch on the variant.
#[derive(Debug, Clone)]
pub enum BusMessage {
    // sprites:fleet
    FleetSummary(Arc<FleetSummary>),
    SpriteExternallyDeleted { sprite_id: String },

    // sprites:<id>
    StateChange(Arc<StateChange>),
    ReconcileResult(Arc<ReconcileResult>),
    HealthUpdate(Arc<HealthUpdate>),

    // sprite:<id>:logs
    LogLine(Arc<LogLine>),

    // intents:all / intents:<id>
    IntentCreated(Arc<Intent>),
    IntentTransitioned(Arc<Intent>),
    /// State-specific companion to `IntentTransitioned`, also emitted once
    /// at creation with the initial `proposed` state.
    IntentState { state: IntentState, intent: Arc<Intent> },
    IntentArtifactAdded { intent: Arc<Intent>, artifact: Artifact },

    // safety:audit
    AuditRecorded(Arc<AuditEntry>),

    // exec:<session_id> / exec:<session_id>:events
    ExecOutput(Arc<ExecOutput>),
    ProtocolEvent(Arc<ProtocolEvent>),

    // runs:all
    RunBlocked(Arc<RunEvent>),
    RunResumed(Arc<RunEvent>),
}

// ============================================================================
// Topic names
// ============================================================================

/// Canonical topic-name constructors. The strings are a stable external
/// contract; build them here rather than inline.
pub mod topics {
    /// Fleet summary recomputations and external-deletion notices.
    pub fn fleet() -> String {
        "sprites:fleet".to_string()
    }

    /// State changes, reconciliation results, and health updates for one sprite.
    pub fn sprite(sprite_id: &str) -> String {
        format!("sprites:{sprite_id}")
    }

    /// Unified log stream for one sprite.
    pub fn sprite_logs(sprite_id: &str) -> String {
        format!("sprite:{sprite_id}:logs")
    }

    /// Lifecycle transitions for all intents.
    pub fn intents_all() -> String {
        "intents:all".to_string()
    }

    /// Lifecycle transitions for one intent.
    pub fn intent(intent_id: &str) -> String {
        format!("intents:{intent_id}")
    }

    /// Audit entries.
    pub fn audit() -> String {
        "safety:audit".to_string()
    }

    /// Raw output chunks for one exec session.
    pub fn exec(session_id: &str) -> String {
        format!("exec:{session_id}")
    }

    /// Parsed protocol events for one exec session.
    pub fn exec_events(session_id: &str) -> String {
        format!("exec:{session_id}:events")
    }

    /// Run lifecycle events from the external executor.
    pub fn runs_all() -> String {
        "runs:all".to_string()
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Process-wide topic pub/sub. Cheap to clone; all clones share topics.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<DashMap<String, broadcast::Sender<BusMessage>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. The receiver sees every message published after
    /// this call, in publish order, until it is dropped or lags past the
    /// channel capacity.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(topic).subscribe()
    }

    /// Publish a message to a topic. Fire-and-forget: no subscribers means
    /// the message is dropped, and a failed send is never surfaced.
    pub fn publish(&self, topic: &str, message: BusMessage) {
        if let Some(tx) = self.topics.get(topic) {
            let _ = tx.send(message);
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |tx| tx.receiver_count())
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(BUS_TOPIC_CAPACITY).0)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new();
        // Must not panic or error
        bus.publish(
            &topics::fleet(),
            BusMessage::SpriteExternallyDeleted { sprite_id: "s1".to_string() },
        );
        assert_eq!(bus.subscriber_count(&topics::fleet()), 0);
    }

    #[tokio::test]
    async fn test_fifo_per_topic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("sprites:s1");

        for i in 0..10 {
            bus.publish(
                "sprites:s1",
                BusMessage::SpriteExternallyDeleted { sprite_id: format!("s{i}") },
            );
        }

        for i in 0..10 {
            match rx.recv().await.unwrap() {
                BusMessage::SpriteExternallyDeleted { sprite_id } => {
                    assert_eq!(sprite_id, format!("s{i}"));
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("sprites:a");
        let mut rx_b = bus.subscribe("sprites:b");

        bus.publish(
            "sprites:a",
            BusMessage::SpriteExternallyDeleted { sprite_id: "a".to_string() },
        );

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        let rx = bus.subscribe("sprites:s1");
        drop(rx);

        for _ in 0..1_000 {
            bus.publish(
                "sprites:s1",
                BusMessage::SpriteExternallyDeleted { sprite_id: "s1".to_string() },
            );
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_later_messages() {
        let bus = EventBus::new();
        bus.publish(
            "sprites:s1",
            BusMessage::SpriteExternallyDeleted { sprite_id: "early".to_string() },
        );

        let mut rx = bus.subscribe("sprites:s1");
        bus.publish(
            "sprites:s1",
            BusMessage::SpriteExternallyDeleted { sprite_id: "late".to_string() },
        );

        match rx.recv().await.unwrap() {
            BusMessage::SpriteExternallyDeleted { sprite_id } => assert_eq!(sprite_id, "late"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
