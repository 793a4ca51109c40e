//! Bridges - subscribers that connect intents to external lifecycles
//!
//! The governance bridge mirrors awaiting intents to an issue tracker and
//! reads label changes back as approvals. The run bridge translates the
//! external executor's blocked/resumed notices into intent state.

pub mod governance;
pub mod runs;

pub use governance::GovernanceBridge;
pub use runs::{RunBridge, RunEvent, RunStatus};
