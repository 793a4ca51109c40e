//! Sprite process - one supervised actor per remote worker
//!
//! Each sprite process owns its state and reconciles it against the worker
//! API on a fixed cycle. All retry is loop-scheduled through the backoff;
//! no API call is retried within a cycle, and cycles never overlap. Two
//! consecutive not-found responses are a confirmed external deletion: the
//! process announces it on `sprites:fleet` and terminates normally.

use super::observation::{Observation, ObservationType, Severity};
use super::state::{
    HealthUpdate, ReconcileOutcome, ReconcileResult, SpriteState, SpriteStatus, StateChange,
};
use crate::capabilities::worker_api::{WorkerApi, WorkerApiError};
use crate::events::{telemetry, topics, BusMessage, EventBus};
use crate::fleet::metadata::{MetadataStore, SpriteMetadata};
use crate::intent::generator::IntentGenerator;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Commands
// ============================================================================

/// Commands accepted by a sprite process.
#[derive(Debug)]
pub enum SpriteCommand {
    /// Snapshot the current state
    GetState { reply: oneshot::Sender<SpriteState> },
    /// Set (or clear) the desired status used for health derivation
    SetDesiredStatus { status: Option<SpriteStatus> },
    /// Replace the tag map atomically
    SetTags { tags: HashMap<String, String> },
    /// Force one reconciliation cycle outside the schedule
    ReconcileNow,
    /// Surface an observation; may produce an intent via the generator
    EmitObservation {
        observation_type: ObservationType,
        severity: Severity,
        data: Value,
    },
}

/// How a sprite process exited. The supervisor restarts crashes but never
/// these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpriteExit {
    /// Two consecutive API not-founds confirmed an external deletion
    ExternallyDeleted,
    /// Cancelled by the fleet manager (explicit remove or shutdown)
    Canceled,
    /// All handles dropped
    ChannelClosed,
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to a running sprite process.
#[derive(Clone)]
pub struct SpriteHandle {
    sprite_id: String,
    tx: mpsc::Sender<SpriteCommand>,
}

impl SpriteHandle {
    pub fn sprite_id(&self) -> &str {
        &self.sprite_id
    }

    /// Whether the process is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn get_state(&self) -> Result<SpriteState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SpriteCommand::GetState { reply })
            .await
            .context("Sprite process channel closed")?;
        rx.await.context("Sprite process dropped the reply")
    }

    pub async fn set_desired_status(&self, status: Option<SpriteStatus>) -> Result<()> {
        self.tx
            .send(SpriteCommand::SetDesiredStatus { status })
            .await
            .context("Sprite process channel closed")
    }

    pub async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        self.tx
            .send(SpriteCommand::SetTags { tags })
            .await
            .context("Sprite process channel closed")
    }

    pub async fn reconcile_now(&self) -> Result<()> {
        self.tx
            .send(SpriteCommand::ReconcileNow)
            .await
            .context("Sprite process channel closed")
    }

    pub async fn emit_observation(
        &self,
        observation_type: ObservationType,
        severity: Severity,
        data: Value,
    ) -> Result<()> {
        self.tx
            .send(SpriteCommand::EmitObservation { observation_type, severity, data })
            .await
            .context("Sprite process channel closed")
    }
}

// ============================================================================
// Process
// ============================================================================

/// Shared collaborators handed to every sprite process.
#[derive(Clone)]
pub struct SpriteDeps {
    pub worker_api: Arc<dyn WorkerApi>,
    pub bus: EventBus,
    /// Observation sink; `None` disables intent generation
    pub generator: Option<Arc<dyn IntentGenerator>>,
    /// Tag/desired-status persistence; `None` in tests
    pub metadata: Option<Arc<MetadataStore>>,
    /// Base cycle interval (config default when `None`)
    pub reconcile_interval: Option<Duration>,
    /// Delay before re-polling after a first not-found (config default when `None`)
    pub not_found_recheck: Option<Duration>,
}

impl SpriteDeps {
    pub fn new(worker_api: Arc<dyn WorkerApi>, bus: EventBus) -> Self {
        Self {
            worker_api,
            bus,
            generator: None,
            metadata: None,
            reconcile_interval: None,
            not_found_recheck: None,
        }
    }
}

enum CycleOutcome {
    /// Schedule the next cycle after this delay
    Continue(Duration),
    /// Confirmed external deletion; terminate normally
    ExternallyDeleted,
}

/// The per-sprite actor. Construct with `spawn`.
pub struct SpriteProcess {
    state: SpriteState,
    rx: mpsc::Receiver<SpriteCommand>,
    deps: SpriteDeps,
    cancel: CancellationToken,
    interval: Duration,
    not_found_recheck: Duration,
    last_health: Option<super::state::Health>,
}

impl SpriteProcess {
    /// Spawn a sprite process. Returns its handle and join handle; the
    /// first reconciliation cycle runs immediately.
    pub fn spawn(
        state: SpriteState,
        deps: SpriteDeps,
        cancel: CancellationToken,
    ) -> (SpriteHandle, JoinHandle<SpriteExit>) {
        let (tx, rx) = mpsc::channel(64);
        let sprite_id = state.sprite_id.clone();
        let config = &crate::config::get().sprite;
        let interval = deps
            .reconcile_interval
            .unwrap_or(Duration::from_millis(config.reconcile_interval_ms));
        let not_found_recheck = deps.not_found_recheck.unwrap_or(Duration::from_millis(
            crate::config::defaults::SPRITE_NOT_FOUND_RECHECK_MS,
        ));

        let process = Self {
            state,
            rx,
            deps,
            cancel,
            interval,
            not_found_recheck,
            last_health: None,
        };
        let join = tokio::spawn(process.run());

        (SpriteHandle { sprite_id, tx }, join)
    }

    async fn run(mut self) -> SpriteExit {
        info!(sprite_id = %self.state.sprite_id, "Sprite process started");
        // First observation right away; drift is corrected before the
        // first full interval elapses.
        let mut next_cycle = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(sprite_id = %self.state.sprite_id, "Sprite process cancelled");
                    return SpriteExit::Canceled;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(SpriteCommand::ReconcileNow) => {
                        match self.run_cycle().await {
                            CycleOutcome::Continue(delay) => next_cycle = Instant::now() + delay,
                            CycleOutcome::ExternallyDeleted => return SpriteExit::ExternallyDeleted,
                        }
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!(sprite_id = %self.state.sprite_id, "Sprite command channel closed");
                        return SpriteExit::ChannelClosed;
                    }
                },
                _ = tokio::time::sleep_until(next_cycle) => {
                    match self.run_cycle().await {
                        CycleOutcome::Continue(delay) => next_cycle = Instant::now() + delay,
                        CycleOutcome::ExternallyDeleted => return SpriteExit::ExternallyDeleted,
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SpriteCommand) {
        match cmd {
            SpriteCommand::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
            SpriteCommand::SetDesiredStatus { status } => {
                self.state.desired_status = status;
                self.persist_metadata();
                self.publish_health_if_changed();
            }
            SpriteCommand::SetTags { tags } => {
                self.state.set_tags(tags);
                self.persist_metadata();
            }
            SpriteCommand::EmitObservation { observation_type, severity, data } => {
                self.handle_observation(observation_type, severity, data).await;
            }
            SpriteCommand::ReconcileNow => {} // handled in the run loop
        }
    }

    async fn handle_observation(
        &mut self,
        observation_type: ObservationType,
        severity: Severity,
        data: Value,
    ) {
        let observation =
            Observation::new(self.state.sprite_id.clone(), observation_type, severity, data);
        telemetry::emit(
            &["lattice", "sprite", "observation"],
            json!({}),
            json!({
                "sprite_id": observation.sprite_id,
                "type": observation.observation_type,
                "severity": observation.severity.to_string(),
            }),
        );

        if let Some(generator) = &self.deps.generator {
            // Skip is a normal result; only log what happened.
            let result = generator.on_observation(&observation).await;
            debug!(sprite_id = %self.state.sprite_id, result = ?result, "Observation handled");
        }
    }

    // One reconciliation cycle: fetch, derive, emit. Exactly one
    // ReconcileResult is published per cycle.
    async fn run_cycle(&mut self) -> CycleOutcome {
        let sprite_id = self.state.sprite_id.clone();
        let outcome = match self.deps.worker_api.get_sprite(&sprite_id).await {
            Ok(api) => {
                match SpriteStatus::from_api(&api.status) {
                    Ok(status) => {
                        let changed = self.state.update_status(status);
                        if let Some(from) = changed {
                            self.publish(BusMessage::StateChange(Arc::new(StateChange {
                                sprite_id: sprite_id.clone(),
                                from,
                                to: status,
                                reason: "API observation".to_string(),
                                at: Utc::now(),
                            })));
                        }
                        self.state.update_api_timestamps(&api);
                        self.state.record_observation();
                        self.state.reset_backoff();

                        let outcome = if changed.is_some() {
                            ReconcileOutcome::Success
                        } else {
                            ReconcileOutcome::NoChange
                        };
                        self.publish_reconcile(outcome, None);
                        CycleOutcome::Continue(self.interval)
                    }
                    Err(reason) => {
                        // The API answered with something we cannot map;
                        // treated as a fetch failure, not a deletion.
                        warn!(sprite_id = %sprite_id, error = %reason, "Unmappable sprite status");
                        self.state.record_failure();
                        self.publish_reconcile(ReconcileOutcome::Failure, Some(reason));
                        CycleOutcome::Continue(self.state.backoff_with_jitter())
                    }
                }
            }
            Err(WorkerApiError::NotFound) => {
                let count = self.state.record_not_found();
                if count >= 2 {
                    info!(sprite_id = %sprite_id, "External deletion confirmed — terminating");
                    telemetry::emit(
                        &["lattice", "sprite", "externally_deleted"],
                        json!({}),
                        json!({"sprite_id": sprite_id}),
                    );
                    self.deps.bus.publish(
                        &topics::fleet(),
                        BusMessage::SpriteExternallyDeleted { sprite_id: sprite_id.clone() },
                    );
                    return CycleOutcome::ExternallyDeleted;
                }
                debug!(sprite_id = %sprite_id, "Sprite not found — rechecking once");
                self.publish_reconcile(
                    ReconcileOutcome::Failure,
                    Some("not_found".to_string()),
                );
                CycleOutcome::Continue(self.not_found_recheck)
            }
            Err(e) => {
                self.state.record_failure();
                warn!(
                    sprite_id = %sprite_id,
                    failure_count = self.state.failure_count,
                    backoff_ms = self.state.backoff_ms,
                    error = %e,
                    "Sprite fetch failed — backing off"
                );
                self.publish_reconcile(ReconcileOutcome::Failure, Some(e.to_string()));
                CycleOutcome::Continue(self.state.backoff_with_jitter())
            }
        };

        self.publish_health_if_changed();
        outcome
    }

    fn publish_reconcile(&self, outcome: ReconcileOutcome, error: Option<String>) {
        self.publish(BusMessage::ReconcileResult(Arc::new(ReconcileResult {
            sprite_id: self.state.sprite_id.clone(),
            outcome,
            error,
            at: Utc::now(),
        })));
    }

    fn publish_health_if_changed(&mut self) {
        let health = self.state.health();
        if self.last_health != Some(health) {
            self.last_health = Some(health);
            self.publish(BusMessage::HealthUpdate(Arc::new(HealthUpdate {
                sprite_id: self.state.sprite_id.clone(),
                health,
                at: Utc::now(),
            })));
        }
    }

    fn publish(&self, message: BusMessage) {
        self.deps.bus.publish(&topics::sprite(&self.state.sprite_id), message);
    }

    fn persist_metadata(&self) {
        if let Some(store) = &self.deps.metadata {
            let metadata = SpriteMetadata {
                tags: self.state.tags.clone(),
                desired_status: self.state.desired_status,
            };
            if let Err(e) = store.put(&self.state.sprite_id, &metadata) {
                warn!(sprite_id = %self.state.sprite_id, error = %e, "Failed to persist sprite metadata");
            }
        }
    }
}
