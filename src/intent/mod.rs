//! Intent subsystem - governed proposals for side-effectful actions
//!
//! An intent is a structured proposal carried through the classify → gate →
//! approve → run pipeline. The store is the single serialized mutation path;
//! every change is validated against the lifecycle state machine, audited,
//! emitted as telemetry, and published on the event bus.

pub mod generator;
pub mod kinds;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod rollback;
pub mod store;

pub use generator::{GeneratorResult, IntentGenerator, ObservationIntentGenerator};
pub use kinds::{KindRegistry, KindSpec, PayloadCheck};
pub use model::{
    Artifact, Intent, IntentOptions, IntentSource, IntentState, Plan, PlanSource, PlanStep,
    SourceType, StepStatus, TransitionEntry,
};
pub use pipeline::Pipeline;
pub use store::{IntentFilter, IntentPatch, IntentStore};

use model::IntentState as State;

/// Intent domain errors. Surfaced synchronously to the direct caller;
/// transient I/O never appears here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },
    #[error("invalid lifecycle state: {0}")]
    InvalidLifecycle(String),
    #[error("field is immutable after approval")]
    Immutable,
    #[error("classification is already set")]
    AlreadyClassified,
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("intent not found: {0}")]
    NotFound(String),
    #[error("intent already exists: {0}")]
    AlreadyExists(String),
    #[error("plan step not found: {0}")]
    StepNotFound(String),
    #[error("intent has no plan attached")]
    NoPlan,
}
