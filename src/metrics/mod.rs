//! Prometheus metrics for the hub.
//!
//! Metric families:
//! - Connections (active, opened/closed, duration, forced disconnects)
//! - Presence transitions
//! - Dispatch (envelopes by type/scope, deliveries, backpressure)
//! - Rate limiting (allowed/denied/exempt/fail-open per rule)
//! - Redis pool health

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, DispatchMetrics, HeartbeatMetrics, PresenceMetrics,
    RateLimitMetrics, RedisMetrics, WsMessageMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "circle_hub";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Active WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of active WebSocket connections"
    ).unwrap();

    /// Users with at least one registered connection
    pub static ref USERS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_users_connected", METRIC_PREFIX),
        "Number of unique connected users"
    ).unwrap();

    /// Users currently considered online (debounce applied)
    pub static ref USERS_ONLINE: IntGauge = register_int_gauge!(
        format!("{}_users_online", METRIC_PREFIX),
        "Number of users currently online"
    ).unwrap();

    /// Rooms with at least one subscriber
    pub static ref ROOMS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_active", METRIC_PREFIX),
        "Number of rooms with at least one subscriber"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Connections rejected during setup, by reason
    pub static ref WS_SETUP_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_setup_rejected_total", METRIC_PREFIX),
        "Connection setups rejected",
        &["reason"]
    ).unwrap();

    /// Hub-initiated disconnects, by reason
    pub static ref FORCED_DISCONNECTS: IntCounterVec = register_int_counter_vec!(
        format!("{}_forced_disconnects_total", METRIC_PREFIX),
        "Connections closed by the hub",
        &["reason"]
    ).unwrap();

    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    /// Inbound client messages by type
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total WebSocket messages received from clients",
        &["type"]
    ).unwrap();

    // ============================================================================
    // Presence Metrics
    // ============================================================================

    pub static ref PRESENCE_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_transitions_total", METRIC_PREFIX),
        "Presence transitions",
        &["to"]
    ).unwrap();

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Envelopes dispatched by type and scope
    pub static ref ENVELOPES_DISPATCHED: IntCounterVec = register_int_counter_vec!(
        format!("{}_envelopes_dispatched_total", METRIC_PREFIX),
        "Total envelopes dispatched",
        &["type", "scope"]
    ).unwrap();

    /// Per-connection delivery outcomes
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Per-connection delivery outcomes",
        &["outcome"]
    ).unwrap();

    /// Backpressure events by envelope type and policy
    pub static ref BACKPRESSURE_DROPS: IntCounterVec = register_int_counter_vec!(
        format!("{}_backpressure_drops_total", METRIC_PREFIX),
        "Items dropped or refused because an outbound queue was full",
        &["type", "policy"]
    ).unwrap();

    // ============================================================================
    // Rate Limiting Metrics
    // ============================================================================

    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Total requests allowed by rate limiter",
        &["rule"]
    ).unwrap();

    pub static ref RATELIMIT_DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Total requests denied by rate limiter",
        &["rule"]
    ).unwrap();

    pub static ref RATELIMIT_EXEMPT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_exempt_total", METRIC_PREFIX),
        "Total requests exempted from rate limiting",
        &["rule"]
    ).unwrap();

    /// Requests allowed because the store failed or timed out
    pub static ref RATELIMIT_FAIL_OPEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_fail_open_total", METRIC_PREFIX),
        "Total requests allowed because the rate-limit store was unavailable",
        &["rule"]
    ).unwrap();

    // ============================================================================
    // Redis Metrics
    // ============================================================================

    /// Redis circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref REDIS_CIRCUIT_BREAKER_STATE: IntGauge = register_int_gauge!(
        format!("{}_redis_circuit_breaker_state", METRIC_PREFIX),
        "Redis circuit breaker state (0=closed, 1=open, 2=half-open)"
    ).unwrap();

    pub static ref REDIS_RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_redis_reconnections_total", METRIC_PREFIX),
        "Total Redis reconnection attempts"
    ).unwrap();

    pub static ref REDIS_MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        format!("{}_redis_messages_received_total", METRIC_PREFIX),
        "Total messages received from Redis pub/sub"
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0]
    ).unwrap();

    pub static ref STALE_CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_stale_connections_total", METRIC_PREFIX),
        "Total connections closed for inactivity"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        CONNECTIONS_TOTAL.set(1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("circle_hub_connections_total"));
    }

    #[test]
    fn test_connection_metrics() {
        CONNECTIONS_TOTAL.set(100);
        USERS_CONNECTED.set(50);
        USERS_ONLINE.set(40);
        ROOMS_ACTIVE.set(10);
        WS_SETUP_REJECTED.with_label_values(&["setup_timeout"]).inc();
        // Just verify no panics
    }

    #[test]
    fn test_redis_metrics() {
        REDIS_CIRCUIT_BREAKER_STATE.set(0);
        REDIS_RECONNECTIONS_TOTAL.inc();
        REDIS_MESSAGES_RECEIVED.inc();
        // Just verify no panics
    }
}
