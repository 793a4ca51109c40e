//! Lattice - fleet control plane for remote agent workers
//!
//! # Usage
//!
//! ```bash
//! # Run against the live worker API (token from environment)
//! LATTICE_WORKER_API_TOKEN=... LATTICE_GITHUB_TOKEN=... cargo run --release
//!
//! # Run fully stubbed (no external systems; development and demos)
//! cargo run -- --stub
//! ```
//!
//! # Environment Variables
//!
//! - `LATTICE_CONFIG`: Path to a TOML config file (see `lattice.toml`)
//! - `LATTICE_WORKER_API_TOKEN`: Worker API credential; absent = stub
//! - `LATTICE_GITHUB_TOKEN`: Governance tracker credential; absent = stub
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lattice::bridge::{GovernanceBridge, RunBridge};
use lattice::capabilities::secrets::{EnvSecretStore, SecretStore, StaticSecretStore};
use lattice::capabilities::worker_api::StubWorkerApi;
use lattice::capabilities::{self, issues::StubIssueTracker};
use lattice::config::{self, LatticeConfig};
use lattice::events::EventBus;
use lattice::exec::{run_drain, ExecRegistry};
use lattice::fleet::{FleetDeps, FleetManager, MetadataStore};
use lattice::intent::generator::ObservationIntentGenerator;
use lattice::intent::kinds::KindRegistry;
use lattice::intent::rollback::RollbackProposer;
use lattice::intent::{IntentStore, Pipeline};
use lattice::safety::AuditLog;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "lattice")]
#[command(about = "Lattice fleet control plane")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file (overrides LATTICE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for local persistence (sprite metadata)
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Force stub capabilities even when credentials are present
    #[arg(long)]
    stub: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// Names for supervised top-level tasks.
#[derive(Debug, Clone, Copy)]
enum TaskName {
    FleetManager,
    GovernanceBridge,
    RunBridge,
    RollbackProposer,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::FleetManager => write!(f, "FleetManager"),
            TaskName::GovernanceBridge => write!(f, "GovernanceBridge"),
            TaskName::RunBridge => write!(f, "RunBridge"),
            TaskName::RollbackProposer => write!(f, "RollbackProposer"),
        }
    }
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    info!("🧵 Lattice starting");

    // Configuration: explicit --config wins, then the standard search order.
    let loaded = match &args.config {
        Some(path) => {
            let mut config = LatticeConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => LatticeConfig::load(),
    };
    config::init(loaded);

    // Local persistence for sprite metadata.
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("Failed to create {}", args.data_dir.display()))?;
    let metadata = Arc::new(
        MetadataStore::open(args.data_dir.join("metadata"))
            .context("Failed to open metadata store")?,
    );
    info!("✓ Metadata store ready");

    // Event substrate and shared stores.
    let bus = EventBus::new();
    let audit = AuditLog::new(bus.clone());
    let store = IntentStore::new(bus.clone(), audit.clone());
    let registry = Arc::new(KindRegistry::builtin());
    let pipeline = Pipeline::new(store.clone(), Arc::clone(&registry));
    let exec_registry = ExecRegistry::new();

    // Capability selection by credential presence (or forced stubs).
    let secrets: Arc<dyn SecretStore> = if args.stub {
        Arc::new(StaticSecretStore::new().with(capabilities::WORKER_API_TOKEN, "stub"))
    } else {
        Arc::new(EnvSecretStore)
    };
    let worker_api = if args.stub {
        info!("Worker API: stub forced by --stub");
        Arc::new(StubWorkerApi::new()) as Arc<dyn capabilities::WorkerApi>
    } else {
        capabilities::select_worker_api(secrets.as_ref())
    };
    let issue_tracker = if args.stub {
        Arc::new(StubIssueTracker::new()) as Arc<dyn capabilities::IssueTracker>
    } else {
        capabilities::select_issue_tracker(secrets.as_ref())
    };

    // Supervisor
    info!("🔒 Supervisor: spawning long-lived tasks");
    let cancel_token = CancellationToken::new();
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: Fleet manager (spawns one sprite process per worker)
    let generator = Arc::new(ObservationIntentGenerator::new(pipeline.clone()));
    let fleet_deps = FleetDeps {
        generator: Some(generator),
        ..FleetDeps::new(Arc::clone(&worker_api), bus.clone(), Arc::clone(&metadata))
    };
    let (fleet_handle, fleet_join) = FleetManager::spawn(fleet_deps, cancel_token.child_token());
    task_set.spawn(async move {
        fleet_join.await.context("Fleet manager panicked")?;
        Ok(TaskName::FleetManager)
    });
    // Retained by dashboards/API surfaces in larger deployments.
    let _ = fleet_handle;

    // Task 2: Governance bridge
    let governance = GovernanceBridge::new(pipeline.clone(), issue_tracker, bus.clone());
    let governance_cancel = cancel_token.child_token();
    task_set.spawn(async move {
        governance.run(governance_cancel).await;
        Ok(TaskName::GovernanceBridge)
    });

    // Task 3: Run bridge
    let run_bridge = RunBridge::new(store.clone(), bus.clone());
    let run_cancel = cancel_token.child_token();
    task_set.spawn(async move {
        run_bridge.run(run_cancel).await;
        Ok(TaskName::RunBridge)
    });

    // Task 4: Rollback proposer (only when enabled)
    if config::get().pipeline.auto_rollback {
        let proposer = RollbackProposer::new(pipeline.clone(), bus.clone());
        let rollback_cancel = cancel_token.child_token();
        task_set.spawn(async move {
            proposer.run(rollback_cancel).await;
            Ok(TaskName::RollbackProposer)
        });
    }

    // Signal handler
    let signal_cancel = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("🛑 Shutdown signal received");
        signal_cancel.cancel();
    });

    info!("✓ Lattice running");

    // Supervisor loop
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: shutdown requested");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: task failed: {}", e);
                        cancel_token.cancel();
                        break;
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        break;
                    }
                    None => {
                        info!("🔒 Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Drain exec sessions inside the configured window, then let the
    // remaining tasks wind down.
    let drain_timeout = Duration::from_millis(config::get().shutdown.drain_timeout_ms);
    let outcome = run_drain(&exec_registry, drain_timeout).await;
    info!(outcome = ?outcome, "Shutdown drain finished");

    task_set.shutdown().await;
    info!("✓ Lattice shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
