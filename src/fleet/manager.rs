//! Fleet manager - supervises one sprite process per tracked worker
//!
//! Discovery runs once at startup (worker API, static-list fallback); after
//! that a periodic reconcile loop corrects drift in both directions: ids
//! the API gained are started, ids it lost are terminated. Child processes
//! that confirm their own external deletion report it on `sprites:fleet`
//! and the manager drops them from the tracked set.

use super::metadata::MetadataStore;
use super::FleetSummary;
use crate::capabilities::worker_api::WorkerApi;
use crate::events::{telemetry, topics, BusMessage, EventBus};
use crate::intent::generator::IntentGenerator;
use crate::sprite::process::{SpriteDeps, SpriteExit, SpriteHandle, SpriteProcess};
use crate::sprite::state::{SpriteOptions, SpriteState, SpriteStatus};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Errors & commands
// ============================================================================

/// Fleet manager domain errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    #[error("sprite already tracked: {0}")]
    Duplicate(String),
    #[error("sprite not found: {0}")]
    NotFound(String),
}

/// Commands accepted by the fleet manager.
enum FleetCommand {
    ListSprites { reply: oneshot::Sender<Vec<(String, SpriteState)>> },
    Summary { reply: oneshot::Sender<FleetSummary> },
    GetSpriteHandle { id: String, reply: oneshot::Sender<Option<SpriteHandle>> },
    WakeSprites { ids: Vec<String>, reply: oneshot::Sender<HashMap<String, Result<(), String>>> },
    SleepSprites { ids: Vec<String>, reply: oneshot::Sender<HashMap<String, Result<(), String>>> },
    AddSprite { id: String, opts: SpriteOptions, reply: oneshot::Sender<Result<(), FleetError>> },
    RemoveSprite { id: String, reply: oneshot::Sender<Result<(), FleetError>> },
    RunAudit,
    SetViewersPresent(bool),
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to the running fleet manager.
#[derive(Clone)]
pub struct FleetHandle {
    tx: mpsc::Sender<FleetCommand>,
}

impl FleetHandle {
    /// Snapshot `(id, state)` for every alive child.
    pub async fn list_sprites(&self) -> Result<Vec<(String, SpriteState)>> {
        self.call(|reply| FleetCommand::ListSprites { reply }).await
    }

    /// Current fleet summary.
    pub async fn fleet_summary(&self) -> Result<FleetSummary> {
        self.call(|reply| FleetCommand::Summary { reply }).await
    }

    /// Address lookup for one sprite process.
    pub async fn get_sprite_handle(&self, id: &str) -> Result<Option<SpriteHandle>> {
        let id = id.to_string();
        self.call(move |reply| FleetCommand::GetSpriteHandle { id, reply }).await
    }

    /// Wake each listed sprite through the worker API. Per-id results.
    pub async fn wake_sprites(&self, ids: Vec<String>) -> Result<HashMap<String, Result<(), String>>> {
        self.call(move |reply| FleetCommand::WakeSprites { ids, reply }).await
    }

    /// Sleep each listed sprite through the worker API. Per-id results.
    pub async fn sleep_sprites(&self, ids: Vec<String>) -> Result<HashMap<String, Result<(), String>>> {
        self.call(move |reply| FleetCommand::SleepSprites { ids, reply }).await
    }

    /// Track a new sprite at runtime.
    pub async fn add_sprite(&self, id: &str, opts: SpriteOptions) -> Result<Result<(), FleetError>> {
        let id = id.to_string();
        self.call(move |reply| FleetCommand::AddSprite { id, opts, reply }).await
    }

    /// Stop tracking a sprite and delete its persisted metadata.
    pub async fn remove_sprite(&self, id: &str) -> Result<Result<(), FleetError>> {
        let id = id.to_string();
        self.call(move |reply| FleetCommand::RemoveSprite { id, reply }).await
    }

    /// Broadcast `reconcile_now` to every child.
    pub async fn run_audit(&self) -> Result<()> {
        self.tx.send(FleetCommand::RunAudit).await.context("Fleet manager channel closed")
    }

    /// Switch the fleet-reconcile cadence between fast and slow.
    pub async fn set_viewers_present(&self, present: bool) -> Result<()> {
        self.tx
            .send(FleetCommand::SetViewersPresent(present))
            .await
            .context("Fleet manager channel closed")
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> FleetCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.context("Fleet manager channel closed")?;
        rx.await.context("Fleet manager dropped the reply")
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Shared collaborators for the fleet manager and its children.
#[derive(Clone)]
pub struct FleetDeps {
    pub worker_api: Arc<dyn WorkerApi>,
    pub bus: EventBus,
    pub metadata: Arc<MetadataStore>,
    pub generator: Option<Arc<dyn IntentGenerator>>,
    /// Override per-sprite cycle interval (tests)
    pub sprite_reconcile_interval: Option<Duration>,
    /// Override the per-sprite not-found recheck delay (tests)
    pub sprite_not_found_recheck: Option<Duration>,
    /// Override fleet reconcile intervals (tests)
    pub reconcile_fast: Option<Duration>,
    pub reconcile_slow: Option<Duration>,
}

impl FleetDeps {
    pub fn new(worker_api: Arc<dyn WorkerApi>, bus: EventBus, metadata: Arc<MetadataStore>) -> Self {
        Self {
            worker_api,
            bus,
            metadata,
            generator: None,
            sprite_reconcile_interval: None,
            sprite_not_found_recheck: None,
            reconcile_fast: None,
            reconcile_slow: None,
        }
    }
}

struct Child {
    handle: SpriteHandle,
    cancel: CancellationToken,
    join: JoinHandle<SpriteExit>,
}

/// The fleet manager actor. Construct with `spawn`.
pub struct FleetManager {
    children: HashMap<String, Child>,
    deps: FleetDeps,
    rx: mpsc::Receiver<FleetCommand>,
    cancel: CancellationToken,
    viewers_present: bool,
    last_summary: Option<FleetSummary>,
}

impl FleetManager {
    /// Spawn the fleet manager. Discovery runs before the first command is
    /// served.
    pub fn spawn(deps: FleetDeps, cancel: CancellationToken) -> (FleetHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let manager = Self {
            children: HashMap::new(),
            deps,
            rx,
            cancel,
            viewers_present: false,
            last_summary: None,
        };
        let join = tokio::spawn(manager.run());
        (FleetHandle { tx }, join)
    }

    async fn run(mut self) {
        self.discover().await;
        self.publish_summary().await;

        let mut fleet_rx = self.deps.bus.subscribe(&topics::fleet());
        let mut next_reconcile = tokio::time::Instant::now() + self.reconcile_interval();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                msg = fleet_rx.recv() => {
                    if let Ok(BusMessage::SpriteExternallyDeleted { sprite_id }) = msg {
                        self.handle_external_deletion(&sprite_id).await;
                    }
                }
                _ = tokio::time::sleep_until(next_reconcile) => {
                    self.reconcile_fleet().await;
                    next_reconcile = tokio::time::Instant::now() + self.reconcile_interval();
                }
            }
        }

        // Cancel children on the way out; their cleanup paths release
        // everything they hold.
        for (id, child) in self.children.drain() {
            debug!(sprite_id = %id, "Cancelling sprite process");
            child.cancel.cancel();
        }
        info!("Fleet manager stopped");
    }

    // ------------------------------------------------------------------
    // Discovery & child lifecycle
    // ------------------------------------------------------------------

    async fn discover(&mut self) {
        let ids = match self.deps.worker_api.list_sprites().await {
            Ok(sprites) => {
                info!(count = sprites.len(), "Fleet discovery from worker API");
                sprites.into_iter().map(|s| s.id).collect::<Vec<_>>()
            }
            Err(e) => {
                let fallback = crate::config::get().fleet.static_sprites.clone();
                warn!(
                    error = %e,
                    fallback = fallback.len(),
                    "Worker API discovery failed — using static sprite list"
                );
                fallback
            }
        };

        for id in ids {
            self.start_child(&id);
        }
    }

    fn start_child(&mut self, id: &str) {
        if self.children.contains_key(id) {
            return;
        }

        // Restore persisted tags and desired status before the process starts.
        let restored = self.deps.metadata.get(id).ok().flatten().unwrap_or_default();
        let state = SpriteState::new(
            id,
            SpriteOptions {
                tags: Some(restored.tags),
                desired_status: restored.desired_status,
                ..SpriteOptions::default()
            },
        );

        let child_cancel = self.cancel.child_token();
        let deps = self.child_deps();
        let (handle, join) = SpriteProcess::spawn(state, deps, child_cancel.clone());

        info!(sprite_id = %id, "Sprite process started");
        self.children
            .insert(id.to_string(), Child { handle, cancel: child_cancel, join });
    }

    fn child_deps(&self) -> SpriteDeps {
        SpriteDeps {
            generator: self.deps.generator.clone(),
            metadata: Some(Arc::clone(&self.deps.metadata)),
            reconcile_interval: self.deps.sprite_reconcile_interval,
            not_found_recheck: self.deps.sprite_not_found_recheck,
            ..SpriteDeps::new(Arc::clone(&self.deps.worker_api), self.deps.bus.clone())
        }
    }

    fn stop_child(&mut self, id: &str) -> bool {
        match self.children.remove(id) {
            Some(child) => {
                child.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn handle_external_deletion(&mut self, sprite_id: &str) {
        let Some(child) = self.children.remove(sprite_id) else {
            return;
        };
        // The child terminated itself before publishing; cancelling is a
        // no-op then, and cleanup if anything is still in flight.
        child.cancel.cancel();
        info!(sprite_id = %sprite_id, "Sprite externally deleted — dropping from fleet");
        if let Err(e) = self.deps.metadata.delete(sprite_id) {
            warn!(sprite_id = %sprite_id, error = %e, "Failed to delete sprite metadata");
        }
        self.publish_summary().await;
    }

    /// Restart children whose tasks died abnormally; reap terminal exits.
    async fn supervise_children(&mut self) {
        let finished: Vec<String> = self
            .children
            .iter()
            .filter(|(_, child)| child.join.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in finished {
            let Some(child) = self.children.remove(&id) else { continue };
            match child.join.await {
                Ok(SpriteExit::ExternallyDeleted) | Ok(SpriteExit::Canceled) => {
                    // Terminal exits are not restarted. External deletion
                    // cleanup happened via the bus message.
                }
                Ok(SpriteExit::ChannelClosed) | Err(_) => {
                    warn!(sprite_id = %id, "Sprite process died — restarting");
                    self.start_child(&id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Fleet reconcile loop
    // ------------------------------------------------------------------

    async fn reconcile_fleet(&mut self) {
        let started = Instant::now();
        self.supervise_children().await;

        let api_sprites = match self.deps.worker_api.list_sprites().await {
            Ok(sprites) => sprites,
            Err(e) => {
                warn!(error = %e, "Fleet reconcile: list_sprites failed — will retry next tick");
                return;
            }
        };

        let api_ids: Vec<String> = api_sprites.into_iter().map(|s| s.id).collect();
        let added: Vec<String> = api_ids
            .iter()
            .filter(|id| !self.children.contains_key(*id))
            .cloned()
            .collect();
        let removed: Vec<String> = self
            .children
            .keys()
            .filter(|id| !api_ids.contains(id))
            .cloned()
            .collect();

        for id in &added {
            info!(sprite_id = %id, "Fleet reconcile: new sprite in API");
            self.start_child(id);
        }
        for id in &removed {
            info!(sprite_id = %id, "Fleet reconcile: sprite gone from API");
            self.stop_child(id);
            if let Err(e) = self.deps.metadata.delete(id) {
                warn!(sprite_id = %id, error = %e, "Failed to delete sprite metadata");
            }
        }

        telemetry::emit(
            &["lattice", "fleet", "reconcile"],
            json!({
                "duration_ms": started.elapsed().as_millis() as u64,
                "added": added.len(),
                "removed": removed.len(),
            }),
            json!({}),
        );

        if !added.is_empty() || !removed.is_empty() {
            self.publish_summary().await;
        }
    }

    fn reconcile_interval(&self) -> Duration {
        let config = &crate::config::get().fleet;
        if self.viewers_present {
            self.deps
                .reconcile_fast
                .unwrap_or(Duration::from_millis(config.reconcile_fast_ms))
        } else {
            self.deps
                .reconcile_slow
                .unwrap_or(Duration::from_millis(config.reconcile_slow_ms))
        }
    }

    // ------------------------------------------------------------------
    // Queries & mutations
    // ------------------------------------------------------------------

    async fn snapshot(&self) -> Vec<(String, SpriteState)> {
        let mut snapshot = Vec::with_capacity(self.children.len());
        for (id, child) in &self.children {
            if let Ok(state) = child.handle.get_state().await {
                snapshot.push((id.clone(), state));
            }
        }
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    async fn summary(&self) -> FleetSummary {
        let snapshot = self.snapshot().await;
        let mut summary = FleetSummary { total: snapshot.len(), ..FleetSummary::default() };
        for (_, state) in &snapshot {
            *summary.by_state.entry(state.status).or_insert(0) += 1;
            *summary.by_health.entry(state.health()).or_insert(0) += 1;
        }
        summary
    }

    async fn publish_summary(&mut self) {
        let summary = self.summary().await;
        if self.last_summary.as_ref() == Some(&summary) {
            return;
        }
        self.last_summary = Some(summary.clone());
        self.deps
            .bus
            .publish(&topics::fleet(), BusMessage::FleetSummary(Arc::new(summary)));
    }

    async fn fan_out(
        &self,
        ids: Vec<String>,
        wake: bool,
    ) -> HashMap<String, Result<(), String>> {
        let mut results = HashMap::with_capacity(ids.len());
        for id in ids {
            let result = if wake {
                self.deps.worker_api.wake(&id).await
            } else {
                self.deps.worker_api.sleep(&id).await
            };
            match result {
                Ok(()) => {
                    if let Some(child) = self.children.get(&id) {
                        let desired = if wake { SpriteStatus::Warm } else { SpriteStatus::Cold };
                        let _ = child.handle.set_desired_status(Some(desired)).await;
                        let _ = child.handle.reconcile_now().await;
                    }
                    results.insert(id, Ok(()));
                }
                Err(e) => {
                    results.insert(id, Err(e.to_string()));
                }
            }
        }
        results
    }

    async fn handle_command(&mut self, cmd: FleetCommand) {
        match cmd {
            FleetCommand::ListSprites { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            FleetCommand::Summary { reply } => {
                let _ = reply.send(self.summary().await);
            }
            FleetCommand::GetSpriteHandle { id, reply } => {
                let handle = self.children.get(&id).map(|c| c.handle.clone());
                let _ = reply.send(handle);
            }
            FleetCommand::WakeSprites { ids, reply } => {
                let _ = reply.send(self.fan_out(ids, true).await);
            }
            FleetCommand::SleepSprites { ids, reply } => {
                let _ = reply.send(self.fan_out(ids, false).await);
            }
            FleetCommand::AddSprite { id, opts, reply } => {
                let result = if self.children.contains_key(&id) {
                    Err(FleetError::Duplicate(id.clone()))
                } else {
                    let state = SpriteState::new(&id, opts);
                    let child_cancel = self.cancel.child_token();
                    let (handle, join) =
                        SpriteProcess::spawn(state, self.child_deps(), child_cancel.clone());
                    self.children
                        .insert(id.clone(), Child { handle, cancel: child_cancel, join });
                    info!(sprite_id = %id, "Sprite added at runtime");
                    Ok(())
                };
                if result.is_ok() {
                    self.publish_summary().await;
                }
                let _ = reply.send(result);
            }
            FleetCommand::RemoveSprite { id, reply } => {
                let result = if self.stop_child(&id) {
                    if let Err(e) = self.deps.metadata.delete(&id) {
                        warn!(sprite_id = %id, error = %e, "Failed to delete sprite metadata");
                    }
                    info!(sprite_id = %id, "Sprite removed");
                    Ok(())
                } else {
                    Err(FleetError::NotFound(id.clone()))
                };
                if result.is_ok() {
                    self.publish_summary().await;
                }
                let _ = reply.send(result);
            }
            FleetCommand::RunAudit => {
                debug!(children = self.children.len(), "Fleet audit: forcing reconcile on all children");
                for child in self.children.values() {
                    let _ = child.handle.reconcile_now().await;
                }
            }
            FleetCommand::SetViewersPresent(present) => {
                if self.viewers_present != present {
                    debug!(viewers = present, "Fleet reconcile cadence switched");
                }
                self.viewers_present = present;
            }
        }
    }
}
