//! Circle membership lookups.
//!
//! Membership is owned by an external service. The hub asks once per
//! connection setup and again when a membership-changed signal arrives.

mod redis_resolver;
mod resolver;
mod subscriber;

use std::sync::Arc;

pub use redis_resolver::RedisMembershipResolver;
pub use resolver::{MembershipError, MembershipResolver, StaticMembershipResolver};
pub use subscriber::{MembershipChanged, MembershipSubscriber};

use crate::config::MembershipConfig;
use crate::redis::RedisPool;

/// Build the resolver selected by configuration
pub fn create_resolver(
    config: &MembershipConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn MembershipResolver> {
    if config.backend == "redis" {
        if let Some(pool) = redis_pool {
            tracing::info!(prefix = %config.redis_prefix, "Using Redis membership resolver");
            return Arc::new(RedisMembershipResolver::new(pool, config.redis_prefix.clone()));
        }
        tracing::warn!("Redis membership resolver requested but pool not available, using static resolver");
    }
    Arc::new(StaticMembershipResolver::new())
}
