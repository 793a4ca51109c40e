//! Event substrate - structured telemetry and topic pub/sub
//!
//! Two planes. Telemetry is synchronous emission of named events
//! (`["lattice", <domain>, <event>]`) to registered handlers. Pub/sub is
//! named string topics carrying tagged [`BusMessage`] values to broadcast
//! subscribers. Dashboards and the governance bridge are pure subscribers;
//! no subsystem polls.

pub mod bus;
pub mod telemetry;

pub use bus::{topics, BusMessage, EventBus, LogLine, LogStream};
