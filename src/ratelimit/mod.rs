//! Distributed sliding-window rate limiting.
//!
//! Three rules are configured: `http` (internal API), `ws_connect`
//! (handshakes) and `ws_message` (inbound client traffic). Each is checked
//! against a `SlidingWindowStore`: Redis sorted sets when several hub
//! instances share quota, an in-process map otherwise.

mod config;
mod limiter;
mod store;

use std::sync::Arc;

pub use config::{KeyStrategy, RateLimitConfig, RateLimitRule};
pub use limiter::{RateLimitResult, RequestIdentity, RuleKind, SlidingWindowLimiter};
pub use store::{
    MemorySlidingWindowStore, RedisSlidingWindowStore, SlidingWindowStore, StoreError,
    WindowSample, KEY_EXPIRY_GRACE_MS,
};

use crate::redis::RedisPool;

/// Build the store selected by configuration, falling back to memory when
/// Redis is requested but no pool is available.
pub fn create_store(
    config: &RateLimitConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn SlidingWindowStore> {
    if config.backend == "redis" {
        if let Some(pool) = redis_pool {
            tracing::info!(prefix = %config.redis_prefix, "Using Redis sliding-window rate limiter");
            return Arc::new(RedisSlidingWindowStore::new(pool));
        }
        tracing::warn!("Redis rate limiter requested but pool not available, falling back to memory");
    } else {
        tracing::info!("Using in-memory sliding-window rate limiter");
    }
    Arc::new(MemorySlidingWindowStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_store_falls_back_to_memory() {
        let config = RateLimitConfig {
            backend: "redis".to_string(),
            ..Default::default()
        };
        assert_eq!(create_store(&config, None).backend_name(), "memory");
        assert_eq!(
            create_store(&RateLimitConfig::default(), None).backend_name(),
            "memory"
        );
    }
}
