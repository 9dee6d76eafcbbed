//! Connection bookkeeping for the real-time hub
//!
//! This module provides:
//! - Connection handles with bounded outbound queues
//! - The user-keyed registry (multi-device)
//! - Connection limits and statistics

mod queue;
mod registry;
mod stats;
mod types;

pub use queue::{OutboundQueue, PushOutcome};
pub use registry::{ConnectionRegistry, Registration};
pub use stats::{ConnectionInfo, RegistryStats};
pub use types::{ConnectionError, ConnectionHandle, ConnectionLimits, LivenessState};
