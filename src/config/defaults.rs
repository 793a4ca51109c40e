//! System-wide default constants.
//!
//! Centralises the timing and policy defaults used across the control plane.
//! Grouped by subsystem for easy discovery. Every value here can be overridden
//! from `lattice.toml` or the matching `LATTICE_*` environment variable.

// ============================================================================
// Fleet manager
// ============================================================================

/// Fleet reconcile interval when at least one dashboard viewer is present (ms).
pub const FLEET_RECONCILE_FAST_MS: u64 = 10_000;

/// Fleet reconcile interval with no viewers present (ms).
pub const FLEET_RECONCILE_SLOW_MS: u64 = 60_000;

// ============================================================================
// Sprite process
// ============================================================================

/// Base interval between per-sprite observation cycles (ms).
pub const SPRITE_RECONCILE_INTERVAL_MS: u64 = 5_000;

/// Initial retry backoff after a failed worker-API fetch (ms).
pub const SPRITE_BASE_BACKOFF_MS: u64 = 1_000;

/// Backoff cap (ms).
pub const SPRITE_MAX_BACKOFF_MS: u64 = 60_000;

/// Consecutive-failure threshold at which sprite health becomes `error`.
pub const SPRITE_MAX_RETRIES: u32 = 10;

/// Delay before re-polling after the first API not-found response (ms).
///
/// A second consecutive not-found confirms external deletion.
pub const SPRITE_NOT_FOUND_RECHECK_MS: u64 = 5_000;

// ============================================================================
// Safety guardrails
// ============================================================================

/// Whether the gate admits `controlled` operations at all.
pub const GUARDRAILS_ALLOW_CONTROLLED: bool = true;

/// Whether the gate admits `dangerous` operations at all.
pub const GUARDRAILS_ALLOW_DANGEROUS: bool = false;

/// Whether `controlled` operations require human-in-the-loop approval.
pub const GUARDRAILS_REQUIRE_APPROVAL_FOR_CONTROLLED: bool = true;

// ============================================================================
// Ambient responder
// ============================================================================

/// Per-thread cooldown for the ambient GitHub responder (ms).
///
/// Consumed by the responder collaborator; carried here so the whole
/// deployment is tuned from one file.
pub const AMBIENT_COOLDOWN_MS: u64 = 60_000;

// ============================================================================
// Shutdown drain
// ============================================================================

/// Maximum time to wait for active exec sessions on shutdown (ms).
pub const SHUTDOWN_DRAIN_TIMEOUT_MS: u64 = 600_000;

/// Interval between drain-poll passes during shutdown (ms).
pub const SHUTDOWN_DRAIN_POLL_MS: u64 = 5_000;

// ============================================================================
// Exec sessions
// ============================================================================

/// Idle timeout after which an exec session closes itself (ms).
pub const EXEC_IDLE_TIMEOUT_MS: u64 = 300_000;

/// Output ring-buffer depth kept per exec session (lines).
pub const EXEC_MAX_BUFFER_LINES: usize = 1_000;

// ============================================================================
// Worker API
// ============================================================================

/// HTTP client timeout for worker-API requests (ms).
pub const WORKER_API_TIMEOUT_MS: u64 = 30_000;

/// Default worker-API base URL.
pub const WORKER_API_BASE_URL: &str = "http://localhost:4000";

// ============================================================================
// Governance bridge
// ============================================================================

/// Interval between governance label-sync passes (ms).
pub const GOVERNANCE_SYNC_INTERVAL_MS: u64 = 60_000;

/// Label that approves an awaiting intent when applied to its issue.
pub const GOVERNANCE_APPROVE_LABEL: &str = "lattice:approve";

/// Label that rejects an awaiting intent when applied to its issue.
pub const GOVERNANCE_REJECT_LABEL: &str = "lattice:reject";

// ============================================================================
// Event bus
// ============================================================================

/// Per-topic broadcast channel capacity. Subscribers that lag further than
/// this are dropped rather than blocking publishers.
pub const BUS_TOPIC_CAPACITY: usize = 256;

/// Number of recent audit entries retained in memory for inspection.
pub const AUDIT_RECENT_CAPACITY: usize = 256;
