//! Sprite subsystem - per-worker state and supervised processes
//!
//! A sprite is a remote compute worker. Its pure state (status, backoff,
//! health, tags) lives in `state`; the owning actor that reconciles it
//! against the worker API lives in `process`; the observation types it
//! surfaces live in `observation`.

pub mod observation;
pub mod process;
pub mod state;

pub use observation::{Observation, ObservationType, Severity};
pub use process::{SpriteCommand, SpriteDeps, SpriteExit, SpriteHandle, SpriteProcess};
pub use state::{Health, SpriteOptions, SpriteState, SpriteStatus};
