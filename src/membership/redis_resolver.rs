use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::redis::RedisPool;

use super::{MembershipError, MembershipResolver};

/// Reads membership sets maintained by the circle service:
/// `{prefix}:user:{user_id}:circles` and `{prefix}:circle:{circle_id}:members`.
pub struct RedisMembershipResolver {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl RedisMembershipResolver {
    pub fn new(pool: Arc<RedisPool>, prefix: String) -> Self {
        Self { pool, prefix }
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:user:{}:circles", self.prefix, user_id)
    }

    fn circle_key(&self, circle_id: &str) -> String {
        format!("{}:circle:{}:members", self.prefix, circle_id)
    }

    async fn smembers(&self, key: String) -> Result<Vec<String>, MembershipError> {
        let mut members: Vec<String> = self
            .pool
            .execute(|mut conn| async move { conn.smembers(&key).await })
            .await?;
        members.sort();
        Ok(members)
    }
}

#[async_trait]
impl MembershipResolver for RedisMembershipResolver {
    async fn circles_for_user(&self, user_id: &str) -> Result<Vec<String>, MembershipError> {
        self.smembers(self.user_key(user_id)).await
    }

    async fn members_of_circle(&self, circle_id: &str) -> Result<Vec<String>, MembershipError> {
        self.smembers(self.circle_key(circle_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::redis::CircuitBreaker;

    #[test]
    fn test_key_layout() {
        let pool = RedisPool::new(&RedisConfig::default(), Arc::new(CircuitBreaker::new())).unwrap();
        let resolver = RedisMembershipResolver::new(Arc::new(pool), "circles".to_string());

        assert_eq!(resolver.user_key("u1"), "circles:user:u1:circles");
        assert_eq!(resolver.circle_key("c1"), "circles:circle:c1:members");
    }
}
