use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::connection_manager::{ConnectionHandle, ConnectionRegistry, PushOutcome};
use crate::metrics::DispatchMetrics;
use crate::rooms::RoomIndex;
use crate::websocket::OutboundMessage;

use super::{BackpressurePolicy, Envelope, EventType, Scope};

/// Why a liveness probe was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReason {
    /// A critical envelope could not be enqueued
    CriticalRejected,
    /// Too many consecutive refused enqueues
    RepeatedFailures,
}

/// Request to verify that a connection's writer is still making progress
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    pub connection_id: Uuid,
    pub writes_at_schedule: u64,
    pub reason: ProbeReason,
}

/// Result of one dispatch call
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub envelope_id: Option<Uuid>,
    /// Connections resolved from the target scope
    pub targeted: usize,
    /// Connections that accepted the envelope into their queue
    pub delivered: usize,
    /// Deliveries that evicted an older queued item
    pub dropped_oldest: usize,
    /// Connections that refused the envelope (queue full)
    pub rejected: usize,
    /// Connections already closing
    pub closed: usize,
    pub probes_scheduled: usize,
}

impl DeliveryReport {
    fn for_envelope(envelope: &Envelope) -> Self {
        Self {
            envelope_id: Some(envelope.id),
            ..Default::default()
        }
    }
}

/// Statistics for the dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub total_dispatched: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_rejected: AtomicU64,
    pub total_dropped_oldest: AtomicU64,
    pub room_dispatches: AtomicU64,
    pub user_dispatches: AtomicU64,
    pub broadcast_dispatches: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            total_dispatched: self.total_dispatched.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_dropped_oldest: self.total_dropped_oldest.load(Ordering::Relaxed),
            room_dispatches: self.room_dispatches.load(Ordering::Relaxed),
            user_dispatches: self.user_dispatches.load(Ordering::Relaxed),
            broadcast_dispatches: self.broadcast_dispatches.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub total_dispatched: u64,
    pub total_delivered: u64,
    pub total_rejected: u64,
    pub total_dropped_oldest: u64,
    pub room_dispatches: u64,
    pub user_dispatches: u64,
    pub broadcast_dispatches: u64,
}

/// Routes envelopes to connections.
///
/// Every operation resolves its scope to a snapshot of connections and hands
/// the envelope to `deliver`. Delivery only enqueues; socket writes happen on
/// each connection's writer task, so a dispatch call never waits on a slow
/// consumer.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
    config: DispatchConfig,
    probes: mpsc::UnboundedSender<LivenessProbe>,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomIndex>,
        config: DispatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LivenessProbe>) {
        let (probes, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            registry,
            rooms,
            config,
            probes,
            stats: DispatcherStats::default(),
        };
        (dispatcher, rx)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Dispatch an envelope to the connections its scope resolves to
    pub fn dispatch(&self, envelope: &Envelope) -> DeliveryReport {
        self.dispatch_except(envelope, None)
    }

    /// Same as `dispatch`, skipping one connection (e.g. the originator)
    #[tracing::instrument(
        name = "dispatcher.dispatch",
        skip(self, envelope),
        fields(
            envelope_id = %envelope.id,
            event_type = %envelope.event_type,
            scope = envelope.scope.label()
        )
    )]
    pub fn dispatch_except(&self, envelope: &Envelope, except: Option<Uuid>) -> DeliveryReport {
        let mut targets = match &envelope.scope {
            Scope::Room(room_id) => {
                self.stats.room_dispatches.fetch_add(1, Ordering::Relaxed);
                self.rooms.members_of(room_id)
            }
            Scope::User(user_id) => {
                self.stats.user_dispatches.fetch_add(1, Ordering::Relaxed);
                self.registry.connections_for_user(user_id)
            }
            Scope::All => {
                self.stats.broadcast_dispatches.fetch_add(1, Ordering::Relaxed);
                self.registry.all_connections()
            }
        };

        if let Some(skip) = except {
            targets.retain(|handle| handle.id != skip);
        }

        self.deliver(&targets, envelope)
    }

    pub fn location_update(&self, room_id: &str, payload: serde_json::Value) -> DeliveryReport {
        self.dispatch(&Envelope::to_room(EventType::LocationUpdate, room_id, payload))
    }

    pub fn place_event(&self, room_id: &str, payload: serde_json::Value) -> DeliveryReport {
        self.dispatch(&Envelope::to_room(EventType::PlaceEvent, room_id, payload))
    }

    pub fn chat_message(&self, room_id: &str, payload: serde_json::Value) -> DeliveryReport {
        self.dispatch(&Envelope::to_room(EventType::ChatMessage, room_id, payload))
    }

    pub fn emergency_alert(&self, room_id: &str, payload: serde_json::Value) -> DeliveryReport {
        self.dispatch(&Envelope::to_room(EventType::EmergencyAlert, room_id, payload))
    }

    pub fn notify_user(&self, user_id: &str, payload: serde_json::Value) -> DeliveryReport {
        self.dispatch(&Envelope::to_user(EventType::Notification, user_id, payload))
    }

    pub fn broadcast_all(&self, event_type: EventType, payload: serde_json::Value) -> DeliveryReport {
        self.dispatch(&Envelope::to_all(event_type, payload))
    }

    /// Delivery primitive: push the envelope onto each target's queue,
    /// applying the envelope type's backpressure policy on full queues.
    pub fn deliver(&self, targets: &[Arc<ConnectionHandle>], envelope: &Envelope) -> DeliveryReport {
        let mut report = DeliveryReport::for_envelope(envelope);
        report.targeted = targets.len();

        self.stats.total_dispatched.fetch_add(1, Ordering::Relaxed);
        DispatchMetrics::record_dispatched(envelope.event_type, envelope.scope.label());

        if targets.is_empty() {
            return report;
        }

        // serialize once, share the frame across all targets
        let outbound = match OutboundMessage::envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(envelope_id = %envelope.id, error = %e, "Failed to serialize envelope");
                return report;
            }
        };
        let policy = self.config.policy_for(envelope.event_type);

        for handle in targets {
            match handle.enqueue(outbound.clone(), policy) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped_oldest += 1;
                    DispatchMetrics::record_backpressure(envelope.event_type, policy);
                    tracing::debug!(
                        connection_id = %handle.id,
                        event_type = %envelope.event_type,
                        "Outbound queue full, dropped oldest item"
                    );
                    if self.check_failures(handle) {
                        report.probes_scheduled += 1;
                    }
                }
                PushOutcome::Rejected => {
                    report.rejected += 1;
                    DispatchMetrics::record_backpressure(envelope.event_type, policy);
                    if self.handle_rejection(handle, envelope, policy) {
                        report.probes_scheduled += 1;
                    }
                }
                PushOutcome::Closed => report.closed += 1,
            }
        }

        self.stats
            .total_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .total_rejected
            .fetch_add(report.rejected as u64, Ordering::Relaxed);
        self.stats
            .total_dropped_oldest
            .fetch_add(report.dropped_oldest as u64, Ordering::Relaxed);
        DispatchMetrics::record_deliveries(report.delivered, report.rejected);

        tracing::debug!(
            envelope_id = %envelope.id,
            targeted = report.targeted,
            delivered = report.delivered,
            rejected = report.rejected,
            "Envelope dispatched"
        );

        report
    }

    /// Returns true when a probe was scheduled
    fn handle_rejection(
        &self,
        handle: &Arc<ConnectionHandle>,
        envelope: &Envelope,
        policy: BackpressurePolicy,
    ) -> bool {
        if policy == BackpressurePolicy::ProbeAndEvict || envelope.event_type.is_critical() {
            tracing::error!(
                connection_id = %handle.id,
                user_id = %handle.user_id,
                envelope_id = %envelope.id,
                event_type = %envelope.event_type,
                queued = handle.queue_len(),
                "Critical envelope refused by full queue, scheduling liveness probe"
            );
            return self.schedule_probe(handle, ProbeReason::CriticalRejected);
        }

        tracing::warn!(
            connection_id = %handle.id,
            envelope_id = %envelope.id,
            event_type = %envelope.event_type,
            "Outbound queue full, envelope dropped"
        );
        self.check_failures(handle)
    }

    fn check_failures(&self, handle: &Arc<ConnectionHandle>) -> bool {
        if handle.consecutive_failures() >= self.config.max_delivery_failures {
            return self.schedule_probe(handle, ProbeReason::RepeatedFailures);
        }
        false
    }

    fn schedule_probe(&self, handle: &Arc<ConnectionHandle>, reason: ProbeReason) -> bool {
        if !handle.begin_probe() {
            return false;
        }

        let probe = LivenessProbe {
            connection_id: handle.id,
            writes_at_schedule: handle.writes_completed(),
            reason,
        };
        if self.probes.send(probe).is_err() {
            // monitor not running; leave the connection to the stale sweep
            handle.end_probe();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomIndex>,
        dispatcher: Dispatcher,
        probes: mpsc::UnboundedReceiver<LivenessProbe>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let (dispatcher, probes) =
            Dispatcher::new(registry.clone(), rooms.clone(), DispatchConfig::default());
        Fixture {
            registry,
            rooms,
            dispatcher,
            probes,
        }
    }

    fn connect(f: &Fixture, user_id: &str, rooms: &[&str], capacity: usize) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(user_id, None, capacity));
        f.registry.register(handle.clone()).unwrap();
        for room in rooms {
            f.rooms.subscribe(&handle, room);
        }
        handle
    }

    #[test]
    fn test_room_dispatch_reaches_only_subscribers() {
        let f = fixture();
        let a = connect(&f, "alice", &["family"], 8);
        let b = connect(&f, "bob", &["family"], 8);
        let c = connect(&f, "carol", &["work"], 8);

        let report = f.dispatcher.location_update("family", json!({"lat": 1.0}));
        assert_eq!(report.targeted, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(a.queue_len(), 1);
        assert_eq!(b.queue_len(), 1);
        assert_eq!(c.queue_len(), 0);
    }

    #[test]
    fn test_user_dispatch_reaches_all_devices() {
        let f = fixture();
        let x = connect(&f, "alice", &[], 8);
        let y = connect(&f, "alice", &[], 8);
        connect(&f, "bob", &[], 8);

        let report = f.dispatcher.notify_user("alice", json!({"title": "hi"}));
        assert_eq!(report.delivered, 2);
        assert_eq!(x.queue_len(), 1);
        assert_eq!(y.queue_len(), 1);
    }

    #[test]
    fn test_broadcast_all_and_except() {
        let f = fixture();
        let a = connect(&f, "alice", &["family"], 8);
        connect(&f, "bob", &["family"], 8);

        assert_eq!(
            f.dispatcher
                .broadcast_all(EventType::Notification, json!({}))
                .delivered,
            2
        );

        let typing = Envelope::to_room(EventType::TypingIndicator, "family", json!({}));
        let report = f.dispatcher.dispatch_except(&typing, Some(a.id));
        assert_eq!(report.targeted, 1);
        assert_eq!(a.queue_len(), 1);
    }

    #[test]
    fn test_location_updates_drop_oldest() {
        let f = fixture();
        let slow = connect(&f, "alice", &["family"], 2);

        for n in 0..4 {
            f.dispatcher.location_update("family", json!({ "n": n }));
        }

        assert_eq!(slow.queue_len(), 2);
        let stats = f.dispatcher.stats();
        assert_eq!(stats.total_dropped_oldest, 2);
        assert_eq!(stats.total_rejected, 0);
    }

    #[test]
    fn test_chat_dropped_when_full() {
        let f = fixture();
        connect(&f, "alice", &["family"], 1);

        assert_eq!(f.dispatcher.chat_message("family", json!({})).delivered, 1);
        let report = f.dispatcher.chat_message("family", json!({}));
        assert_eq!(report.rejected, 1);
        assert_eq!(report.probes_scheduled, 0);
    }

    #[test]
    fn test_rejected_emergency_schedules_single_probe() {
        let mut f = fixture();
        let slow = connect(&f, "alice", &["family"], 1);
        let fast = connect(&f, "bob", &["family"], 16);

        f.dispatcher.emergency_alert("family", json!({"n": 0}));
        let report = f.dispatcher.emergency_alert("family", json!({"n": 1}));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.probes_scheduled, 1);

        // a second refusal does not schedule another probe
        let report = f.dispatcher.emergency_alert("family", json!({"n": 2}));
        assert_eq!(report.probes_scheduled, 0);

        let probe = f.probes.try_recv().unwrap();
        assert_eq!(probe.connection_id, slow.id);
        assert_eq!(probe.reason, ProbeReason::CriticalRejected);
        assert!(f.probes.try_recv().is_err());
        assert_eq!(fast.queue_len(), 3);
    }

    #[test]
    fn test_repeated_failures_schedule_probe() {
        let mut f = fixture();
        connect(&f, "alice", &["family"], 1);

        f.dispatcher.chat_message("family", json!({}));
        for _ in 0..3 {
            f.dispatcher.chat_message("family", json!({}));
        }

        let probe = f.probes.try_recv().unwrap();
        assert_eq!(probe.reason, ProbeReason::RepeatedFailures);
    }

    #[test]
    fn test_closed_connection_counted_separately() {
        let f = fixture();
        let a = connect(&f, "alice", &[], 4);
        a.close();

        let report = f.dispatcher.notify_user("alice", json!({}));
        assert_eq!(report.closed, 1);
        assert_eq!(report.delivered, 0);
    }
}
