//! Health check and statistics endpoints.

use std::time::Duration;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::connection_manager::RegistryStats;
use crate::dispatch::DispatcherStatsSnapshot;
use crate::redis::CircuitBreakerStats;
use crate::rooms::RoomStats;
use crate::server::AppState;

const REDIS_PING_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub connected: bool,
    pub circuit_breaker: CircuitBreakerStats,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub unique_users: usize,
    pub rooms: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: RegistryStats,
    pub rooms: RoomStats,
    pub dispatch: DispatcherStatsSnapshot,
    pub online_users: usize,
    pub ratelimit: RateLimitStats,
}

#[derive(Debug, Serialize)]
pub struct RateLimitStats {
    pub enabled: bool,
    pub backend: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis = match state.redis_pool {
        Some(ref pool) => {
            let connected = matches!(
                tokio::time::timeout(REDIS_PING_TIMEOUT, pool.ping()).await,
                Ok(Ok(()))
            );
            Some(RedisHealthResponse {
                connected,
                circuit_breaker: pool.circuit_breaker().stats(),
            })
        }
        None => None,
    };

    let degraded = redis.as_ref().is_some_and(|r| !r.connected);
    let status = if !state.hub.is_running() {
        "shutting_down"
    } else if degraded {
        "degraded"
    } else {
        "healthy"
    };

    let stats = state.hub.stats();
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        redis,
        connections: ConnectionHealthResponse {
            total: stats.connections.total_connections,
            unique_users: stats.connections.unique_users,
            rooms: stats.rooms.rooms,
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.hub.stats();
    Json(StatsResponse {
        connections: stats.connections,
        rooms: stats.rooms,
        dispatch: stats.dispatch,
        online_users: stats.online_users,
        ratelimit: RateLimitStats {
            enabled: state.limiter.is_enabled(),
            backend: state.limiter.backend_name(),
        },
    })
}
