//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::dispatch::{BackpressurePolicy, EventType};

use super::{
    BACKPRESSURE_DROPS, CONNECTIONS_TOTAL, DELIVERIES_TOTAL, ENVELOPES_DISPATCHED,
    FORCED_DISCONNECTS, HEARTBEAT_DURATION_MS, PRESENCE_TRANSITIONS, RATELIMIT_ALLOWED_TOTAL,
    RATELIMIT_DENIED_TOTAL, RATELIMIT_EXEMPT_TOTAL, RATELIMIT_FAIL_OPEN_TOTAL,
    REDIS_CIRCUIT_BREAKER_STATE, REDIS_MESSAGES_RECEIVED, REDIS_RECONNECTIONS_TOTAL, ROOMS_ACTIVE,
    STALE_CONNECTIONS_TOTAL, USERS_CONNECTED, USERS_ONLINE, WS_CONNECTIONS_CLOSED,
    WS_CONNECTIONS_OPENED, WS_CONNECTION_DURATION, WS_MESSAGES_RECEIVED, WS_SETUP_REJECTED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    /// Record a closed connection and how long it lived
    pub fn record_closed(duration_secs: f64) {
        WS_CONNECTIONS_CLOSED.inc();
        WS_CONNECTION_DURATION.observe(duration_secs);
    }

    pub fn record_setup_rejected(reason: &str) {
        WS_SETUP_REJECTED.with_label_values(&[reason]).inc();
    }

    pub fn record_forced_disconnect(reason: &str) {
        FORCED_DISCONNECTS.with_label_values(&[reason]).inc();
    }

    /// Refresh gauges from a registry/room snapshot
    pub fn set_gauges(connections: usize, users: usize, online: usize, rooms: usize) {
        CONNECTIONS_TOTAL.set(connections as i64);
        USERS_CONNECTED.set(users as i64);
        USERS_ONLINE.set(online as i64);
        ROOMS_ACTIVE.set(rooms as i64);
    }
}

/// Helper struct for recording inbound WebSocket message metrics
pub struct WsMessageMetrics;

impl WsMessageMetrics {
    pub fn record(kind: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }

    pub fn record_malformed() {
        WS_MESSAGES_RECEIVED.with_label_values(&["malformed"]).inc();
    }
}

/// Helper struct for presence metrics
pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_transition(online: bool) {
        let to = if online { "online" } else { "offline" };
        PRESENCE_TRANSITIONS.with_label_values(&[to]).inc();
    }
}

/// Helper struct for dispatch metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn record_dispatched(event_type: EventType, scope: &str) {
        ENVELOPES_DISPATCHED
            .with_label_values(&[event_type.as_str(), scope])
            .inc();
    }

    pub fn record_deliveries(delivered: usize, rejected: usize) {
        if delivered > 0 {
            DELIVERIES_TOTAL
                .with_label_values(&["delivered"])
                .inc_by(delivered as u64);
        }
        if rejected > 0 {
            DELIVERIES_TOTAL
                .with_label_values(&["rejected"])
                .inc_by(rejected as u64);
        }
    }

    pub fn record_backpressure(event_type: EventType, policy: BackpressurePolicy) {
        BACKPRESSURE_DROPS
            .with_label_values(&[event_type.as_str(), policy.as_str()])
            .inc();
    }
}

/// Helper struct for recording rate limit metrics, labelled by rule name
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record_allowed(rule: &str) {
        RATELIMIT_ALLOWED_TOTAL.with_label_values(&[rule]).inc();
    }

    pub fn record_denied(rule: &str) {
        RATELIMIT_DENIED_TOTAL.with_label_values(&[rule]).inc();
    }

    pub fn record_exempt(rule: &str) {
        RATELIMIT_EXEMPT_TOTAL.with_label_values(&[rule]).inc();
    }

    pub fn record_fail_open(rule: &str) {
        RATELIMIT_FAIL_OPEN_TOTAL.with_label_values(&[rule]).inc();
    }
}

/// Helper struct for Redis metrics
pub struct RedisMetrics;

impl RedisMetrics {
    /// 0=closed, 1=open, 2=half-open
    pub fn set_circuit_state(state: i64) {
        REDIS_CIRCUIT_BREAKER_STATE.set(state);
    }

    pub fn record_reconnect() {
        REDIS_RECONNECTIONS_TOTAL.inc();
    }

    pub fn record_message_received() {
        REDIS_MESSAGES_RECEIVED.inc();
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_duration_ms(duration_ms: u64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms as f64);
    }

    pub fn record_stale(count: usize) {
        STALE_CONNECTIONS_TOTAL.inc_by(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_metrics() {
        DispatchMetrics::record_dispatched(EventType::ChatMessage, "room");
        DispatchMetrics::record_deliveries(5, 1);
        DispatchMetrics::record_backpressure(
            EventType::LocationUpdate,
            BackpressurePolicy::DropOldest,
        );
        // Just verify no panics
    }

    #[test]
    fn test_rate_limit_metrics() {
        RateLimitMetrics::record_allowed("http");
        RateLimitMetrics::record_denied("ws_message");
        RateLimitMetrics::record_exempt("http");
        RateLimitMetrics::record_fail_open("ws_connect");

        let output = encode_metrics().unwrap();
        assert!(output.contains("circle_hub_ratelimit_fail_open_total"));
    }

    #[test]
    fn test_presence_and_connection_metrics() {
        PresenceMetrics::record_transition(true);
        PresenceMetrics::record_transition(false);
        ConnectionMetrics::record_opened();
        ConnectionMetrics::record_closed(12.5);
        ConnectionMetrics::record_forced_disconnect("unresponsive");
        ConnectionMetrics::set_gauges(3, 2, 2, 1);
        WsMessageMetrics::record("ping");
        HeartbeatMetrics::record_duration_ms(4);
        // Just verify no panics
    }
}
