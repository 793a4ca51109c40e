//! Lattice Configuration Module
//!
//! Provides deployment configuration loaded from TOML files, with every
//! timing interval and policy toggle overridable via environment variables.
//!
//! ## Loading Order
//!
//! 1. `LATTICE_CONFIG` environment variable (path to TOML file)
//! 2. `lattice.toml` in the current working directory
//! 3. Built-in defaults
//! 4. `LATTICE_*` environment overrides, applied last
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(LatticeConfig::load());
//!
//! // Anywhere in the codebase:
//! let interval = config::get().sprite.reconcile_interval_ms;
//! ```

mod lattice_config;
pub mod defaults;

pub use lattice_config::*;

use std::sync::OnceLock;

/// Global deployment configuration, initialized once at startup.
static LATTICE_CONFIG: OnceLock<LatticeConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: LatticeConfig) {
    if LATTICE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Falls back to built-in defaults when `init()` has not been called, which
/// keeps library consumers and unit tests working without a startup dance.
pub fn get() -> &'static LatticeConfig {
    LATTICE_CONFIG.get_or_init(LatticeConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    LATTICE_CONFIG.get().is_some()
}
