use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::connection_manager::ConnectionHandle;

/// Circles resolved for a user at registration time
#[derive(Debug, Clone)]
pub struct CachedMembership {
    pub circles: Vec<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub rooms: usize,
    pub subscriptions: usize,
    pub cached_users: usize,
}

/// Room (circle) -> subscribed connections.
///
/// Rooms hold weak references and never keep a connection alive. Empty
/// rooms are dropped when their last subscriber leaves; a lookup on a
/// missing room simply yields no members.
pub struct RoomIndex {
    rooms: DashMap<String, HashMap<Uuid, Weak<ConnectionHandle>>>,
    memberships: DashMap<String, CachedMembership>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    /// Subscribe a connection to a room. Returns false if already subscribed.
    pub fn subscribe(&self, handle: &Arc<ConnectionHandle>, room_id: &str) -> bool {
        if handle.is_closed() {
            return false;
        }

        let inserted = self
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(handle.id, Arc::downgrade(handle))
            .is_none();
        handle.add_room(room_id);

        if inserted {
            tracing::debug!(connection_id = %handle.id, room_id = %room_id, "Subscribed to room");
        }
        inserted
    }

    /// Unsubscribe a connection from a room. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, handle: &ConnectionHandle, room_id: &str) -> bool {
        let removed = self
            .rooms
            .get_mut(room_id)
            .map(|mut members| members.remove(&handle.id).is_some())
            .unwrap_or(false);
        handle.remove_room(room_id);
        self.rooms.remove_if(room_id, |_, members| members.is_empty());

        if removed {
            tracing::debug!(connection_id = %handle.id, room_id = %room_id, "Unsubscribed from room");
        }
        removed
    }

    /// Drop every subscription held by a connection
    pub fn unsubscribe_all(&self, handle: &ConnectionHandle) -> Vec<String> {
        let rooms = handle.rooms();
        for room_id in &rooms {
            self.unsubscribe(handle, room_id);
        }
        rooms
    }

    /// Snapshot of live connections currently subscribed to a room
    pub fn members_of(&self, room_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let Some(members) = self.rooms.get(room_id) else {
            return Vec::new();
        };

        members
            .values()
            .filter_map(Weak::upgrade)
            .filter(|handle| !handle.is_closed())
            .collect()
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn cache_circles(&self, user_id: &str, circles: Vec<String>) {
        self.memberships.insert(
            user_id.to_string(),
            CachedMembership {
                circles,
                resolved_at: Utc::now(),
            },
        );
    }

    pub fn cached_circles(&self, user_id: &str) -> Option<Vec<String>> {
        self.memberships.get(user_id).map(|m| m.circles.clone())
    }

    pub fn invalidate_user(&self, user_id: &str) -> bool {
        self.memberships.remove(user_id).is_some()
    }

    /// Invalidate every cached membership that mentions `circle_id`.
    /// Returns the affected users.
    pub fn invalidate_circle(&self, circle_id: &str) -> Vec<String> {
        let affected: Vec<String> = self
            .memberships
            .iter()
            .filter(|entry| entry.value().circles.iter().any(|c| c == circle_id))
            .map(|entry| entry.key().clone())
            .collect();

        for user_id in &affected {
            self.memberships.remove(user_id);
        }
        affected
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            rooms: self.rooms.len(),
            subscriptions: self.rooms.iter().map(|r| r.value().len()).sum(),
            cached_users: self.memberships.len(),
        }
    }
}

impl Default for RoomIndex {
    fn default() -> Self {
        Self::new()
    }
}
