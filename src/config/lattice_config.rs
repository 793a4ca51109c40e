//! Lattice configuration - all control-plane tunables as operator-editable TOML
//!
//! Every timing interval and policy toggle is a field in this module. Each
//! struct implements `Default` with values from `config::defaults`, so the
//! process behaves identically whether or not a config file is present.
//! Individual fields can also be overridden with `LATTICE_*` environment
//! variables, which take precedence over the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a Lattice deployment.
///
/// Load with `LatticeConfig::load()` which searches:
/// 1. `$LATTICE_CONFIG` env var
/// 2. `./lattice.toml`
/// 3. Built-in defaults
///
/// Environment overrides are applied after the file is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatticeConfig {
    /// Fleet manager timings and static discovery fallback
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Per-sprite reconciliation and backoff tuning
    #[serde(default)]
    pub sprite: SpriteConfig,

    /// Safety gate policy toggles
    #[serde(default)]
    pub guardrails: GuardrailsConfig,

    /// Repositories whose task intents skip human approval
    #[serde(default)]
    pub task_allowlist: TaskAllowlistConfig,

    /// Ambient responder tuning
    #[serde(default)]
    pub ambient: AmbientConfig,

    /// Shutdown drain window
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Exec session tuning
    #[serde(default)]
    pub exec: ExecConfig,

    /// Worker API endpoint
    #[serde(default)]
    pub worker_api: WorkerApiConfig,

    /// Governance bridge (issue tracker) settings
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Intent pipeline toggles
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Fleet manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Fleet-reconcile interval when dashboard viewers are present (ms)
    pub reconcile_fast_ms: u64,
    /// Fleet-reconcile interval otherwise (ms)
    pub reconcile_slow_ms: u64,
    /// Sprite ids to manage when worker-API discovery fails at startup
    pub static_sprites: Vec<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            reconcile_fast_ms: defaults::FLEET_RECONCILE_FAST_MS,
            reconcile_slow_ms: defaults::FLEET_RECONCILE_SLOW_MS,
            static_sprites: Vec::new(),
        }
    }
}

/// Per-sprite process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpriteConfig {
    /// Base interval between observation cycles (ms)
    pub reconcile_interval_ms: u64,
    /// Initial retry backoff (ms)
    pub base_backoff_ms: u64,
    /// Backoff cap (ms)
    pub max_backoff_ms: u64,
    /// Failure count at which health becomes `error`
    pub max_retries: u32,
}

impl Default for SpriteConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: defaults::SPRITE_RECONCILE_INTERVAL_MS,
            base_backoff_ms: defaults::SPRITE_BASE_BACKOFF_MS,
            max_backoff_ms: defaults::SPRITE_MAX_BACKOFF_MS,
            max_retries: defaults::SPRITE_MAX_RETRIES,
        }
    }
}

/// Safety gate policy toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    /// Gate admits controlled operations
    pub allow_controlled: bool,
    /// Gate admits dangerous operations (still requires approval)
    pub allow_dangerous: bool,
    /// Controlled operations require human-in-the-loop approval
    pub require_approval_for_controlled: bool,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            allow_controlled: defaults::GUARDRAILS_ALLOW_CONTROLLED,
            allow_dangerous: defaults::GUARDRAILS_ALLOW_DANGEROUS,
            require_approval_for_controlled: defaults::GUARDRAILS_REQUIRE_APPROVAL_FOR_CONTROLLED,
        }
    }
}

/// Task auto-approval allowlist
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskAllowlistConfig {
    /// `owner/name` repositories whose task intents are auto-approved even
    /// when controlled operations normally require approval
    pub auto_approve_repos: Vec<String>,
}

/// Ambient responder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientConfig {
    /// Per-thread cooldown (ms)
    pub cooldown_ms: u64,
}

impl Default for AmbientConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: defaults::AMBIENT_COOLDOWN_MS,
        }
    }
}

/// Shutdown drain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Drain window on termination signal (ms)
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: defaults::SHUTDOWN_DRAIN_TIMEOUT_MS,
        }
    }
}

/// Exec session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Idle close timeout (ms)
    pub idle_timeout_ms: u64,
    /// Output ring-buffer depth (lines)
    pub max_buffer_lines: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: defaults::EXEC_IDLE_TIMEOUT_MS,
            max_buffer_lines: defaults::EXEC_MAX_BUFFER_LINES,
        }
    }
}

/// Worker API endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerApiConfig {
    /// Base URL of the worker API
    pub base_url: String,
    /// Request timeout (ms)
    pub timeout_ms: u64,
}

impl Default for WorkerApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::WORKER_API_BASE_URL.to_string(),
            timeout_ms: defaults::WORKER_API_TIMEOUT_MS,
        }
    }
}

/// Governance bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// `owner/name` repository that receives approval issues
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Interval between label-sync passes (ms)
    pub sync_interval_ms: u64,
    /// Label that approves an awaiting intent
    pub approve_label: String,
    /// Label that rejects an awaiting intent
    pub reject_label: String,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            repo: None,
            sync_interval_ms: defaults::GOVERNANCE_SYNC_INTERVAL_MS,
            approve_label: defaults::GOVERNANCE_APPROVE_LABEL.to_string(),
            reject_label: defaults::GOVERNANCE_REJECT_LABEL.to_string(),
        }
    }
}

/// Intent pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Automatically propose rollback intents for failed intents that carry
    /// a rollback strategy
    pub auto_rollback: bool,
}

// ============================================================================
// Loading
// ============================================================================

/// Configuration load errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl LatticeConfig {
    /// Load configuration using the standard search order:
    /// 1. `$LATTICE_CONFIG` environment variable
    /// 2. `./lattice.toml` in the current working directory
    /// 3. Built-in defaults
    ///
    /// Environment overrides are applied last in every case.
    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.apply_env_overrides();
        config
    }

    fn load_file() -> Self {
        if let Ok(path) = std::env::var("LATTICE_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from LATTICE_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from LATTICE_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "LATTICE_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("lattice.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./lattice.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./lattice.toml, using defaults");
                }
            }
        }

        info!("No lattice.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `LATTICE_*` environment variable overrides on top of the loaded
    /// values. Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        override_u64("LATTICE_FLEET_RECONCILE_FAST_MS", &mut self.fleet.reconcile_fast_ms);
        override_u64("LATTICE_FLEET_RECONCILE_SLOW_MS", &mut self.fleet.reconcile_slow_ms);
        override_u64("LATTICE_SPRITE_RECONCILE_INTERVAL_MS", &mut self.sprite.reconcile_interval_ms);
        override_u64("LATTICE_SPRITE_BASE_BACKOFF_MS", &mut self.sprite.base_backoff_ms);
        override_u64("LATTICE_SPRITE_MAX_BACKOFF_MS", &mut self.sprite.max_backoff_ms);
        override_u32("LATTICE_SPRITE_MAX_RETRIES", &mut self.sprite.max_retries);
        override_bool("LATTICE_ALLOW_CONTROLLED", &mut self.guardrails.allow_controlled);
        override_bool("LATTICE_ALLOW_DANGEROUS", &mut self.guardrails.allow_dangerous);
        override_bool(
            "LATTICE_REQUIRE_APPROVAL_FOR_CONTROLLED",
            &mut self.guardrails.require_approval_for_controlled,
        );
        override_u64("LATTICE_AMBIENT_COOLDOWN_MS", &mut self.ambient.cooldown_ms);
        override_u64("LATTICE_SHUTDOWN_DRAIN_TIMEOUT_MS", &mut self.shutdown.drain_timeout_ms);
        override_u64("LATTICE_EXEC_IDLE_TIMEOUT_MS", &mut self.exec.idle_timeout_ms);
        override_usize("LATTICE_EXEC_MAX_BUFFER_LINES", &mut self.exec.max_buffer_lines);
        override_u64("LATTICE_WORKER_API_TIMEOUT_MS", &mut self.worker_api.timeout_ms);
        override_u64("LATTICE_GOVERNANCE_SYNC_INTERVAL_MS", &mut self.governance.sync_interval_ms);
        override_bool("LATTICE_PIPELINE_AUTO_ROLLBACK", &mut self.pipeline.auto_rollback);

        if let Ok(v) = std::env::var("LATTICE_WORKER_API_BASE_URL") {
            self.worker_api.base_url = v;
        }
        if let Ok(v) = std::env::var("LATTICE_GOVERNANCE_REPO") {
            self.governance.repo = Some(v);
        }
        if let Ok(v) = std::env::var("LATTICE_AUTO_APPROVE_REPOS") {
            self.task_allowlist.auto_approve_repos = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("LATTICE_STATIC_SPRITES") {
            self.fleet.static_sprites = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}

fn override_u64(var: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(var = var, value = %raw, "Ignoring unparseable env override"),
        }
    }
}

fn override_u32(var: &str, target: &mut u32) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(var = var, value = %raw, "Ignoring unparseable env override"),
        }
    }
}

fn override_usize(var: &str, target: &mut usize) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(var = var, value = %raw, "Ignoring unparseable env override"),
        }
    }
}

fn override_bool(var: &str, target: &mut bool) {
    if let Ok(raw) = std::env::var(var) {
        match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => *target = true,
            "false" | "0" | "no" => *target = false,
            _ => warn!(var = var, value = %raw, "Ignoring unparseable env override"),
        }
    }
}
