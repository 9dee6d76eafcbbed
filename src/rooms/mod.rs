//! Room (circle) membership index

mod index;

pub use index::{CachedMembership, RoomIndex, RoomStats};
