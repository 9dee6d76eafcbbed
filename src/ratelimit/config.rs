//! Rate limiting configuration

use serde::Deserialize;

/// How the rate-limit key is derived from a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// `ip:<addr>`
    Ip,
    /// `user:<id>`
    User,
    /// `user:<id>` when authenticated, else `ip:<addr>`
    UserOrIp,
    /// A single shared `global` key
    Global,
}

/// One admission rule: at most `limit` requests per trailing `window_seconds`
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_seconds: u64,
    #[serde(default = "default_strategy")]
    pub strategy: KeyStrategy,
}

fn default_strategy() -> KeyStrategy {
    KeyStrategy::UserOrIp
}

impl RateLimitRule {
    pub fn new(limit: u32, window_seconds: u64, strategy: KeyStrategy) -> Self {
        Self {
            limit,
            window_seconds,
            strategy,
        }
    }

    pub fn window_ms(&self) -> i64 {
        (self.window_seconds as i64).saturating_mul(1000)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "memory" (single instance) or "redis" (shared across instances)
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    /// Upper bound on one store round-trip; exceeding it fails open
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Path prefixes never rate limited
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
    /// User-agent substrings never rate limited (health checkers, scrapers)
    #[serde(default = "default_exempt_user_agents")]
    pub exempt_user_agents: Vec<String>,
    /// Internal HTTP API
    #[serde(default = "default_http_rule")]
    pub http: RateLimitRule,
    /// WebSocket handshakes
    #[serde(default = "default_ws_connect_rule")]
    pub ws_connect: RateLimitRule,
    /// Inbound WebSocket messages
    #[serde(default = "default_ws_message_rule")]
    pub ws_message: RateLimitRule,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_redis_prefix() -> String {
    "circle-hub:ratelimit".to_string()
}

fn default_store_timeout_ms() -> u64 {
    200
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

fn default_exempt_user_agents() -> Vec<String> {
    vec![
        "kube-probe".to_string(),
        "Prometheus".to_string(),
        "ELB-HealthChecker".to_string(),
    ]
}

fn default_http_rule() -> RateLimitRule {
    RateLimitRule::new(100, 60, KeyStrategy::UserOrIp)
}

fn default_ws_connect_rule() -> RateLimitRule {
    RateLimitRule::new(10, 60, KeyStrategy::Ip)
}

fn default_ws_message_rule() -> RateLimitRule {
    RateLimitRule::new(60, 10, KeyStrategy::User)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: default_backend(),
            redis_prefix: default_redis_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
            exempt_paths: default_exempt_paths(),
            exempt_user_agents: default_exempt_user_agents(),
            http: default_http_rule(),
            ws_connect: default_ws_connect_rule(),
            ws_message: default_ws_message_rule(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_deserializes_with_default_strategy() {
        let rule: RateLimitRule =
            serde_json::from_value(serde_json::json!({"limit": 5, "window_seconds": 60})).unwrap();
        assert_eq!(rule.strategy, KeyStrategy::UserOrIp);
        assert_eq!(rule.window_ms(), 60_000);

        let rule: RateLimitRule = serde_json::from_value(
            serde_json::json!({"limit": 1, "window_seconds": 1, "strategy": "global"}),
        )
        .unwrap();
        assert_eq!(rule.strategy, KeyStrategy::Global);
    }

    #[test]
    fn test_defaults() {
        let config = RateLimitConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.backend, "memory");
        assert_eq!(config.store_timeout_ms, 200);
        assert_eq!(config.ws_connect.strategy, KeyStrategy::Ip);
        assert!(config.exempt_paths.contains(&"/health".to_string()));
    }
}
