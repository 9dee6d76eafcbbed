//! Bounded per-connection outbound queue.
//!
//! Producers never wait: `push` either enqueues, evicts the oldest evictable
//! item (drop-oldest), or refuses. The connection's writer task is the single
//! consumer and awaits `pop`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::dispatch::BackpressurePolicy;
use crate::websocket::OutboundMessage;

/// Result of a push attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest evictable item
    DroppedOldest,
    /// Queue full, new item refused
    Rejected,
    /// Queue closed, connection is going away
    Closed,
}

impl PushOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, PushOutcome::Queued | PushOutcome::DroppedOldest)
    }
}

struct QueueState {
    items: VecDeque<OutboundMessage>,
    closed: bool,
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, message: OutboundMessage, policy: BackpressurePolicy) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            if state.items.len() < self.capacity {
                state.items.push_back(message);
                PushOutcome::Queued
            } else if policy == BackpressurePolicy::DropOldest {
                match state.items.iter().position(|m| m.is_evictable()) {
                    Some(idx) => {
                        state.items.remove(idx);
                        state.items.push_back(message);
                        PushOutcome::DroppedOldest
                    }
                    None => PushOutcome::Rejected,
                }
            } else {
                PushOutcome::Rejected
            }
        };

        if outcome.is_queued() {
            // single consumer: a stored permit is enough to avoid lost wakeups
            self.notify.notify_one();
        }
        outcome
    }

    /// Wait for the next item. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<OutboundMessage> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(message) = state.items.pop_front() {
                    return Some(message);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue and discard pending items. Returns the discarded count.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Envelope, EventType};
    use crate::websocket::ControlMessage;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn envelope(event_type: EventType, n: u32) -> OutboundMessage {
        OutboundMessage::envelope(&Envelope::to_room(event_type, "c1", json!({ "n": n }))).unwrap()
    }

    fn payload_n(message: &OutboundMessage) -> u64 {
        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        value["payload"]["n"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        for n in 0..3 {
            assert_eq!(
                queue.push(envelope(EventType::ChatMessage, n), BackpressurePolicy::DropNewest),
                PushOutcome::Queued
            );
        }

        for expected in 0..3 {
            let message = queue.pop().await.unwrap();
            assert_eq!(payload_n(&message), expected);
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_front() {
        let queue = OutboundQueue::new(2);
        queue.push(envelope(EventType::LocationUpdate, 0), BackpressurePolicy::DropOldest);
        queue.push(envelope(EventType::LocationUpdate, 1), BackpressurePolicy::DropOldest);

        let outcome = queue.push(envelope(EventType::LocationUpdate, 2), BackpressurePolicy::DropOldest);
        assert_eq!(outcome, PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 2);

        assert_eq!(payload_n(&queue.pop().await.unwrap()), 1);
        assert_eq!(payload_n(&queue.pop().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_never_evicts_critical() {
        let queue = OutboundQueue::new(2);
        queue.push(envelope(EventType::EmergencyAlert, 0), BackpressurePolicy::ProbeAndEvict);
        queue.push(envelope(EventType::LocationUpdate, 1), BackpressurePolicy::DropOldest);

        // location at index 1 is the only evictable item
        let outcome = queue.push(envelope(EventType::LocationUpdate, 2), BackpressurePolicy::DropOldest);
        assert_eq!(outcome, PushOutcome::DroppedOldest);
        assert_eq!(payload_n(&queue.pop().await.unwrap()), 0);
        assert_eq!(payload_n(&queue.pop().await.unwrap()), 2);

        let queue = OutboundQueue::new(1);
        queue.push(envelope(EventType::EmergencyAlert, 0), BackpressurePolicy::ProbeAndEvict);
        let outcome = queue.push(envelope(EventType::LocationUpdate, 1), BackpressurePolicy::DropOldest);
        assert_eq!(outcome, PushOutcome::Rejected);
    }

    #[test]
    fn test_drop_newest_rejects_when_full() {
        let queue = OutboundQueue::new(1);
        assert!(queue
            .push(envelope(EventType::ChatMessage, 0), BackpressurePolicy::DropNewest)
            .is_queued());
        assert_eq!(
            queue.push(envelope(EventType::ChatMessage, 1), BackpressurePolicy::DropNewest),
            PushOutcome::Rejected
        );
        assert!(queue.is_full());
    }

    #[tokio::test]
    async fn test_close_discards_and_wakes_consumer() {
        let queue = Arc::new(OutboundQueue::new(4));
        queue.push(ControlMessage::Heartbeat.into(), BackpressurePolicy::DropOldest);

        assert_eq!(queue.close(), 1);
        assert!(queue.pop().await.is_none());
        assert_eq!(
            queue.push(ControlMessage::Pong.into(), BackpressurePolicy::DropOldest),
            PushOutcome::Closed
        );

        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_waiting_consumer_receives_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(ControlMessage::Heartbeat.into(), BackpressurePolicy::DropOldest);

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert!(matches!(
            popped,
            Some(OutboundMessage::Control(ControlMessage::Heartbeat))
        ));
    }
}
