use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::metrics::PresenceMetrics;

/// Presence of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub device_count: usize,
}

/// Emitted on every Offline <-> Online transition
#[derive(Debug, Clone, Serialize)]
pub struct PresenceChange {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub device_count: usize,
    /// Rooms the change should be announced to
    #[serde(skip)]
    pub rooms: Vec<String>,
}

struct PresenceSlot {
    entry: PresenceEntry,
    /// Bumped on every transition; a debounce timer only fires if unchanged
    generation: u64,
    pending_offline: bool,
    rooms: Vec<String>,
}

impl PresenceSlot {
    fn change(&self, user_id: &str) -> PresenceChange {
        PresenceChange {
            user_id: user_id.to_string(),
            is_online: self.entry.is_online,
            last_seen: self.entry.last_seen,
            device_count: self.entry.device_count,
            rooms: self.rooms.clone(),
        }
    }
}

/// Online/offline state derived from registry transitions.
///
/// `Offline -> Online` fires on the first registered connection.
/// `Online -> Offline` fires only after the last connection has been gone for
/// the whole debounce window; a reconnect inside the window cancels it.
pub struct PresenceTracker {
    entries: Arc<DashMap<String, PresenceSlot>>,
    debounce: Duration,
    events: mpsc::UnboundedSender<PresenceChange>,
}

impl PresenceTracker {
    pub fn new(debounce: Duration) -> (Self, mpsc::UnboundedReceiver<PresenceChange>) {
        let (events, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            entries: Arc::new(DashMap::new()),
            debounce,
            events,
        };
        (tracker, rx)
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Record a newly registered connection; `device_count` includes it.
    pub fn connection_opened(&self, user_id: &str, device_count: usize, rooms: &[String]) {
        let now = Utc::now();
        let mut slot = self
            .entries
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceSlot {
                entry: PresenceEntry {
                    is_online: false,
                    last_seen: now,
                    device_count: 0,
                },
                generation: 0,
                pending_offline: false,
                rooms: Vec::new(),
            });

        slot.generation += 1;
        slot.entry.device_count = device_count;
        slot.entry.last_seen = now;
        slot.rooms = rooms.to_vec();

        if slot.pending_offline {
            slot.pending_offline = false;
            tracing::debug!(user_id = %user_id, "Reconnect absorbed by offline debounce");
            return;
        }

        if !slot.entry.is_online {
            slot.entry.is_online = true;
            PresenceMetrics::record_transition(true);
            tracing::info!(user_id = %user_id, device_count = device_count, "User online");
            let _ = self.events.send(slot.change(user_id));
        }
    }

    /// Record an unregistered connection; `remaining` excludes it.
    pub fn connection_closed(&self, user_id: &str, remaining: usize, rooms: &[String]) {
        let Some(mut slot) = self.entries.get_mut(user_id) else {
            return;
        };

        slot.entry.device_count = remaining;
        slot.entry.last_seen = Utc::now();
        if remaining > 0 || !slot.entry.is_online {
            return;
        }

        slot.generation += 1;
        slot.rooms = rooms.to_vec();

        if self.debounce.is_zero() {
            slot.entry.is_online = false;
            PresenceMetrics::record_transition(false);
            tracing::info!(user_id = %user_id, "User offline");
            let _ = self.events.send(slot.change(user_id));
            return;
        }

        slot.pending_offline = true;
        let generation = slot.generation;
        drop(slot);

        let entries = self.entries.clone();
        let events = self.events.clone();
        let debounce = self.debounce;
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            let Some(mut slot) = entries.get_mut(&user_id) else {
                return;
            };
            if slot.generation != generation || !slot.pending_offline {
                return;
            }

            slot.pending_offline = false;
            slot.entry.is_online = false;
            slot.entry.last_seen = Utc::now();
            PresenceMetrics::record_transition(false);
            tracing::info!(user_id = %user_id, "User offline after debounce");
            let _ = events.send(slot.change(&user_id));
        });
    }

    /// Pure read; never blocks on I/O
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.entries
            .get(user_id)
            .map(|slot| slot.entry.is_online)
            .unwrap_or(false)
    }

    pub fn get(&self, user_id: &str) -> Option<PresenceEntry> {
        self.entries.get(user_id).map(|slot| slot.entry.clone())
    }

    pub fn is_pending_offline(&self, user_id: &str) -> bool {
        self.entries
            .get(user_id)
            .map(|slot| slot.pending_offline)
            .unwrap_or(false)
    }

    pub fn online_users(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|slot| slot.entry.is_online)
            .map(|slot| slot.key().clone())
            .collect()
    }
}
