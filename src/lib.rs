//! Lattice: fleet control plane for remote agent workers
//!
//! Manages a fleet of remote compute workers ("sprites") that run AI coding
//! agents, and governs every side-effectful action they propose through a
//! classify-gate-audit pipeline.
//!
//! ## Architecture
//!
//! - **Fleet control plane**: one supervised task per sprite, reconciling
//!   observed state against the worker API with backoff and health derivation
//! - **Intent pipeline**: propose → classify → gate → approve | await human
//!   approval, with immutability after approval and full audit
//! - **Event substrate**: structured telemetry plus topic pub/sub carrying
//!   state transitions, audit entries, exec output, and intent lifecycle
//!   events to subscribers

pub mod bridge;
pub mod capabilities;
pub mod config;
pub mod events;
pub mod exec;
pub mod fleet;
pub mod ids;
pub mod intent;
pub mod safety;
pub mod sprite;

// Re-export the types most embedders touch
pub use config::LatticeConfig;
pub use events::{BusMessage, EventBus};
pub use fleet::{FleetHandle, FleetManager, FleetSummary, MetadataStore};
pub use intent::{Intent, IntentState, IntentStore, Pipeline};
pub use safety::{AuditLog, Classification};
pub use sprite::{Health, SpriteState, SpriteStatus};
