//! Presence tracking derived from connection registry transitions

mod tracker;

pub use tracker::{PresenceChange, PresenceEntry, PresenceTracker};
