//! Envelope types and fan-out to connections.
//!
//! Five logical dispatch operations (room, user, broadcast-all and their
//! typed shortcuts) all funnel through `Dispatcher::deliver`.

mod dispatcher;
mod envelope;

pub use dispatcher::{
    DeliveryReport, Dispatcher, DispatcherStats, DispatcherStatsSnapshot, LivenessProbe,
    ProbeReason,
};
pub use envelope::{BackpressurePolicy, Envelope, EventType, Scope};
