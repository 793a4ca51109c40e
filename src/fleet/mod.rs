//! Fleet subsystem - discovery, child lifecycle, and drift reconciliation
//!
//! The fleet manager owns one sprite process per tracked worker, reconciles
//! the tracked set against the worker API, and fans wake/sleep requests out
//! to the platform. Sprite tags and desired status survive restarts through
//! the metadata store.

pub mod manager;
pub mod metadata;

pub use manager::{FleetDeps, FleetError, FleetHandle, FleetManager};
pub use metadata::{MetadataStore, SpriteMetadata};

use crate::sprite::state::{Health, SpriteStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot of the fleet published on `sprites:fleet`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetSummary {
    pub total: usize,
    pub by_state: HashMap<SpriteStatus, usize>,
    pub by_health: HashMap<Health, usize>,
}
