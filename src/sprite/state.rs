//! Sprite state - pure data and transitions for one remote worker
//!
//! Everything in this module is side-effect free: backoff math, health
//! derivation, tag and status mutation, API timestamp mirroring. The owning
//! sprite process (`sprite::process`) is the only mutator; other tasks see
//! snapshots.

use crate::capabilities::worker_api::ApiSprite;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// Status & Health
// ============================================================================

/// API-reported operational status of a sprite.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpriteStatus {
    /// Stopped; must be woken before it can run tasks
    Cold,
    /// Provisioned and idle
    Warm,
    /// Actively executing
    Running,
}

impl SpriteStatus {
    /// Translate a worker-API status string into the internal status.
    ///
    /// The API reports `sleeping` for machines it has parked; Lattice folds
    /// that into `cold`. Anything unrecognized is an error.
    pub fn from_api(raw: &str) -> Result<Self, String> {
        match raw {
            "running" => Ok(Self::Running),
            "cold" | "sleeping" => Ok(Self::Cold),
            "warm" => Ok(Self::Warm),
            other => Err(format!("unknown sprite status: {other}")),
        }
    }
}

impl std::fmt::Display for SpriteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cold => write!(f, "cold"),
            Self::Warm => write!(f, "warm"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Derived health of a sprite process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Observed matches desired and no recent failures
    Ok,
    /// Observed differs from desired but the API is reachable
    Converging,
    /// Some failed fetches, below the retry ceiling
    Degraded,
    /// Failure count reached `max_retries`
    Error,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Converging => write!(f, "converging"),
            Self::Degraded => write!(f, "degraded"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ============================================================================
// Sprite state
// ============================================================================

/// Options for constructing a [`SpriteState`].
#[derive(Debug, Clone, Default)]
pub struct SpriteOptions {
    pub name: Option<String>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub tags: Option<HashMap<String, String>>,
    pub desired_status: Option<SpriteStatus>,
}

/// Full state for one sprite, owned by its process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpriteState {
    /// Opaque id, unique within the fleet
    pub sprite_id: String,
    /// Optional human-readable name
    pub name: Option<String>,
    /// Last observed API status
    pub status: SpriteStatus,
    /// Desired status, used for health derivation and wake/sleep intent
    pub desired_status: Option<SpriteStatus>,

    // Backoff state
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_ms: u64,
    pub failure_count: u32,
    pub not_found_count: u32,
    pub max_retries: u32,

    // Process timestamps
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_observed_at: Option<DateTime<Utc>>,

    // Mirrored API timestamps
    pub api_created_at: Option<DateTime<Utc>>,
    pub api_updated_at: Option<DateTime<Utc>>,
    pub api_last_started_at: Option<DateTime<Utc>>,
    pub api_last_active_at: Option<DateTime<Utc>>,

    /// Lattice-local tags; not round-tripped to the API
    pub tags: HashMap<String, String>,
}

impl SpriteState {
    /// Create state for a newly tracked sprite. Backoff fields default from
    /// the global sprite config unless overridden in `opts`.
    pub fn new(sprite_id: impl Into<String>, opts: SpriteOptions) -> Self {
        let cfg = &crate::config::get().sprite;
        let base = opts.base_backoff_ms.unwrap_or(cfg.base_backoff_ms);
        let now = Utc::now();
        Self {
            sprite_id: sprite_id.into(),
            name: opts.name,
            status: SpriteStatus::Cold,
            desired_status: opts.desired_status,
            base_backoff_ms: base,
            max_backoff_ms: opts.max_backoff_ms.unwrap_or(cfg.max_backoff_ms),
            backoff_ms: base,
            failure_count: 0,
            not_found_count: 0,
            max_retries: opts.max_retries.unwrap_or(cfg.max_retries),
            started_at: now,
            updated_at: now,
            last_observed_at: None,
            api_created_at: None,
            api_updated_at: None,
            api_last_started_at: None,
            api_last_active_at: None,
            tags: opts.tags.unwrap_or_default(),
        }
    }

    /// Set the observed status. Returns the previous status when it changed.
    pub fn update_status(&mut self, status: SpriteStatus) -> Option<SpriteStatus> {
        let previous = self.status;
        self.touch();
        if previous == status {
            None
        } else {
            self.status = status;
            Some(previous)
        }
    }

    /// Record a failed API fetch: increments the failure count and computes
    /// `backoff_ms = min(base * 2^(n-1), max)`.
    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        // Cap the exponent so the shift cannot overflow; the max clamp
        // dominates long before 2^20 anyway.
        let exp = (self.failure_count - 1).min(20);
        let raw = self.base_backoff_ms.saturating_mul(1u64 << exp);
        self.backoff_ms = raw.min(self.max_backoff_ms);
        self.touch();
    }

    /// Reset the failure tracking after a successful observation.
    pub fn reset_backoff(&mut self) {
        self.failure_count = 0;
        self.backoff_ms = self.base_backoff_ms;
        self.touch();
    }

    /// Replace the tag map atomically.
    pub fn set_tags(&mut self, tags: HashMap<String, String>) {
        self.tags = tags;
        self.touch();
    }

    /// Record a successful API read.
    pub fn record_observation(&mut self) {
        let now = Utc::now();
        self.last_observed_at = Some(now);
        self.not_found_count = 0;
        self.updated_at = now;
    }

    /// Record an API not-found response. Returns the new consecutive count.
    pub fn record_not_found(&mut self) -> u32 {
        self.not_found_count = self.not_found_count.saturating_add(1);
        self.touch();
        self.not_found_count
    }

    /// Current backoff with uniform ±25% jitter applied, floored at zero.
    pub fn backoff_with_jitter(&self) -> Duration {
        use rand::Rng;
        let quarter = (self.backoff_ms / 4) as i64;
        let delta = if quarter > 0 {
            rand::thread_rng().gen_range(-quarter..=quarter)
        } else {
            0
        };
        let jittered = (self.backoff_ms as i64 + delta).max(0) as u64;
        Duration::from_millis(jittered)
    }

    /// Mirror timestamps from an API sprite record. Fields the API did not
    /// send (or that fail to parse as RFC 3339) are left untouched.
    pub fn update_api_timestamps(&mut self, api: &ApiSprite) {
        if let Some(ts) = parse_api_timestamp(api.created_at.as_deref()) {
            self.api_created_at = Some(ts);
        }
        if let Some(ts) = parse_api_timestamp(api.updated_at.as_deref()) {
            self.api_updated_at = Some(ts);
        }
        if let Some(ts) = parse_api_timestamp(api.last_started_at.as_deref()) {
            self.api_last_started_at = Some(ts);
        }
        if let Some(ts) = parse_api_timestamp(api.last_active_at.as_deref()) {
            self.api_last_active_at = Some(ts);
        }
        self.touch();
    }

    /// Derive health from desired-vs-observed status and the failure count.
    pub fn health(&self) -> Health {
        if self.max_retries == 0 && self.failure_count > 0 {
            return Health::Error;
        }
        if self.failure_count >= self.max_retries && self.max_retries > 0 {
            return Health::Error;
        }
        if self.failure_count > 0 {
            return Health::Degraded;
        }
        match self.desired_status {
            Some(desired) if desired != self.status => Health::Converging,
            _ => Health::Ok,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn parse_api_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(_) => None,
    }
}

// ============================================================================
// Event payloads
// ============================================================================

/// Published on `sprites:<id>` when the observed status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub sprite_id: String,
    pub from: SpriteStatus,
    pub to: SpriteStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Outcome of one reconciliation cycle. Exactly one is published per cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    NoChange,
    Success,
    Failure,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoChange => write!(f, "no_change"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Published on `sprites:<id>` after every reconciliation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub sprite_id: String,
    pub outcome: ReconcileOutcome,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Published on `sprites:<id>` when derived health changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthUpdate {
    pub sprite_id: String,
    pub health: Health,
    pub at: DateTime<Utc>,
}
