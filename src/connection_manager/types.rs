//! Connection handle and related types

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::BackpressurePolicy;
use crate::websocket::{ControlMessage, OutboundMessage};

use super::queue::{OutboundQueue, PushOutcome};

/// Liveness of a connection as seen by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LivenessState {
    Alive = 0,
    /// A liveness probe is pending
    Probing = 1,
    Closed = 2,
}

impl From<u8> for LivenessState {
    fn from(value: u8) -> Self {
        match value {
            1 => LivenessState::Probing,
            2 => LivenessState::Closed,
            _ => LivenessState::Alive,
        }
    }
}

/// One live transport session.
///
/// Owned by the registry; rooms and the dispatcher only hold `Arc` clones
/// taken from snapshots.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub device_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds)
    last_activity: AtomicI64,
    rooms: RwLock<HashSet<String>>,
    queue: OutboundQueue,
    cancel: CancellationToken,
    liveness: AtomicU8,
    writes_completed: AtomicU64,
    consecutive_failures: AtomicU32,
    probe_pending: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>, device_id: Option<String>, queue_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            device_id,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            rooms: RwLock::new(HashSet::new()),
            queue: OutboundQueue::new(queue_capacity),
            cancel: CancellationToken::new(),
            liveness: AtomicU8::new(LivenessState::Alive as u8),
            writes_completed: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            probe_pending: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        self.last_activity.store(at.timestamp(), Ordering::Relaxed);
    }

    /// Enqueue without waiting. Tracks consecutive refusals for liveness checks.
    pub fn enqueue(&self, message: OutboundMessage, policy: BackpressurePolicy) -> PushOutcome {
        let outcome = self.queue.push(message, policy);
        match outcome {
            PushOutcome::Queued => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            PushOutcome::DroppedOldest | PushOutcome::Rejected => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Closed => {}
        }
        outcome
    }

    /// Enqueue a control frame (drop-oldest semantics for evictable frames)
    pub fn send_control(&self, control: ControlMessage) -> PushOutcome {
        let policy = if OutboundMessage::Control(control.clone()).is_evictable() {
            BackpressurePolicy::DropOldest
        } else {
            BackpressurePolicy::DropNewest
        };
        self.queue.push(control.into(), policy)
    }

    /// Next item for the writer. Resolves to `None` once the connection is closed.
    pub async fn next_outbound(&self) -> Option<OutboundMessage> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            message = self.queue.pop() => message,
        }
    }

    /// Called by the writer after a frame reached the transport
    pub fn record_write(&self) {
        self.writes_completed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn writes_completed(&self) -> u64 {
        self.writes_completed.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Mark a probe as pending. Returns false if one is already scheduled.
    pub fn begin_probe(&self) -> bool {
        let first = !self.probe_pending.swap(true, Ordering::AcqRel);
        if first {
            let _ = self.liveness.compare_exchange(
                LivenessState::Alive as u8,
                LivenessState::Probing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        first
    }

    pub fn end_probe(&self) {
        self.probe_pending.store(false, Ordering::Release);
        let _ = self.liveness.compare_exchange(
            LivenessState::Probing as u8,
            LivenessState::Alive as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn liveness(&self) -> LivenessState {
        LivenessState::from(self.liveness.load(Ordering::Acquire))
    }

    /// Close with a reason the writer reports to the client.
    /// The first recorded reason wins.
    pub fn close_with_reason(&self, reason: &str) -> usize {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.close()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Cancel the writer and discard whatever is still queued.
    pub fn close(&self) -> usize {
        self.liveness
            .store(LivenessState::Closed as u8, Ordering::Release);
        self.cancel.cancel();
        self.queue.close()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the hub closes this connection
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().iter().cloned().collect()
    }

    pub fn is_in_room(&self, room_id: &str) -> bool {
        self.rooms.read().contains(room_id)
    }

    pub(crate) fn add_room(&self, room_id: &str) -> bool {
        self.rooms.write().insert(room_id.to_string())
    }

    pub(crate) fn remove_room(&self, room_id: &str) -> bool {
        self.rooms.write().remove(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("liveness", &self.liveness())
            .field("queued", &self.queue_len())
            .finish()
    }
}

/// Error returned when connection limits are exceeded
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },
    #[error("User {user_id} connection limit exceeded ({current}/{max})")]
    UserLimitExceeded {
        user_id: String,
        current: usize,
        max: usize,
    },
}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_user: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_user: 5,
        }
    }
}
