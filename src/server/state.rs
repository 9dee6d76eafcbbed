use std::sync::Arc;
use std::time::Instant;

use crate::auth::JwtValidator;
use crate::config::Settings;
use crate::error::AppError;
use crate::hub::{Hub, HubConfig};
use crate::membership::create_resolver;
use crate::ratelimit::{create_store, SlidingWindowLimiter};
use crate::redis::{CircuitBreaker, RedisPool};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub hub: Arc<Hub>,
    pub limiter: Arc<SlidingWindowLimiter>,
    /// Present when any component is configured with the Redis backend
    pub redis_pool: Option<Arc<RedisPool>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        let needs_redis =
            settings.membership.backend == "redis" || settings.ratelimit.backend == "redis";
        let redis_pool = if needs_redis {
            let breaker = Arc::new(CircuitBreaker::new());
            Some(Arc::new(RedisPool::new(&settings.redis, breaker)?))
        } else {
            None
        };

        let auth = Arc::new(JwtValidator::new(&settings.jwt));
        let membership = create_resolver(&settings.membership, redis_pool.clone());
        let hub = Arc::new(Hub::new(HubConfig::from_settings(&settings), auth, membership));

        let store = create_store(&settings.ratelimit, redis_pool.clone());
        let limiter = Arc::new(SlidingWindowLimiter::new(store, settings.ratelimit.clone()));

        Ok(Self::from_parts(settings, hub, limiter, redis_pool))
    }

    /// Assemble from already-built components
    pub fn from_parts(
        settings: Settings,
        hub: Arc<Hub>,
        limiter: Arc<SlidingWindowLimiter>,
        redis_pool: Option<Arc<RedisPool>>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            hub,
            limiter,
            redis_pool,
            start_time: Instant::now(),
        }
    }
}
