use std::collections::HashMap;
use std::env;

use std::net::IpAddr;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::dispatch::{BackpressurePolicy, EventType};
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Heartbeat interval in seconds (server sends heartbeat frame)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connection timeout in seconds (disconnect if no activity)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Cleanup task interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Bounded outbound queue size per connection
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Upper bound for token validation + membership resolution
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    120
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_setup_timeout_ms() -> u64 {
    3000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_user() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Grace period before the last disconnect turns into an offline event.
    /// Absorbs app backgrounding and quick reconnects.
    #[serde(default = "default_offline_debounce_ms")]
    pub offline_debounce_ms: u64,
}

fn default_offline_debounce_ms() -> u64 {
    7000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Backpressure policy overrides keyed by envelope type (e.g. "location_update")
    #[serde(default)]
    pub policies: HashMap<EventType, BackpressurePolicy>,
    /// How long a probed connection gets to make write progress
    #[serde(default = "default_liveness_grace_ms")]
    pub liveness_grace_ms: u64,
    /// Consecutive failed enqueues before a liveness probe is scheduled
    #[serde(default = "default_max_delivery_failures")]
    pub max_delivery_failures: u32,
}

fn default_liveness_grace_ms() -> u64 {
    2000
}

fn default_max_delivery_failures() -> u32 {
    3
}

impl DispatchConfig {
    /// Policy for an envelope type, falling back to the built-in default.
    pub fn policy_for(&self, event_type: EventType) -> BackpressurePolicy {
        self.policies
            .get(&event_type)
            .copied()
            .unwrap_or_else(|| event_type.default_policy())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    /// "static" (in-memory) or "redis"
    #[serde(default = "default_membership_backend")]
    pub backend: String,
    #[serde(default = "default_membership_prefix")]
    pub redis_prefix: String,
    /// Pub/Sub channel carrying membership-changed signals
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
}

fn default_membership_backend() -> String {
    "static".to_string()
}

fn default_membership_prefix() -> String {
    "circles".to_string()
}

fn default_invalidation_channel() -> String {
    "circles:membership-changed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reverse proxies whose `X-Forwarded-For` is believed. Empty means
    /// clients are identified by the socket peer address only.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    pub key: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("websocket.heartbeat_interval", 30)?
            .set_default("websocket.connection_timeout", 120)?
            .set_default("websocket.cleanup_interval", 60)?
            .set_default("presence.offline_debounce_ms", 7000)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER_PORT, JWT_SECRET, REDIS_URL, RATELIMIT_BACKEND, ...
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            setup_timeout_ms: default_setup_timeout_ms(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            offline_debounce_ms: default_offline_debounce_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policies: HashMap::new(),
            liveness_grace_ms: default_liveness_grace_ms(),
            max_delivery_failures: default_max_delivery_failures(),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            backend: default_membership_backend(),
            redis_prefix: default_membership_prefix(),
            invalidation_channel: default_invalidation_channel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);

        let ws = WebSocketConfig::default();
        assert_eq!(ws.outbound_queue_capacity, 64);
        assert_eq!(ws.max_connections_per_user, 5);

        assert_eq!(PresenceConfig::default().offline_debounce_ms, 7000);
    }

    #[test]
    fn test_dispatch_policy_override() {
        let mut dispatch = DispatchConfig::default();
        assert_eq!(
            dispatch.policy_for(EventType::LocationUpdate),
            BackpressurePolicy::DropOldest
        );
        assert_eq!(
            dispatch.policy_for(EventType::EmergencyAlert),
            BackpressurePolicy::ProbeAndEvict
        );

        dispatch
            .policies
            .insert(EventType::LocationUpdate, BackpressurePolicy::DropNewest);
        assert_eq!(
            dispatch.policy_for(EventType::LocationUpdate),
            BackpressurePolicy::DropNewest
        );
    }

    #[test]
    fn test_policy_map_deserializes_from_snake_case() {
        let json = serde_json::json!({
            "policies": { "chat_message": "drop_oldest" },
            "liveness_grace_ms": 500
        });
        let dispatch: DispatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(
            dispatch.policy_for(EventType::ChatMessage),
            BackpressurePolicy::DropOldest
        );
        assert_eq!(dispatch.liveness_grace_ms, 500);
        assert_eq!(dispatch.max_delivery_failures, 3);
    }
}
