//! Sliding-window log admission control

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::RateLimitMetrics;

use super::config::{KeyStrategy, RateLimitConfig, RateLimitRule};
use super::store::{SlidingWindowStore, StoreError, WindowSample};

/// The configured rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Http,
    WsConnect,
    WsMessage,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Http => "http",
            RuleKind::WsConnect => "ws_connect",
            RuleKind::WsMessage => "ws_message",
        }
    }
}

/// Who is asking, and for what
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub path: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestIdentity {
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Default::default()
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Key suffix for a strategy
    pub fn key_for(&self, strategy: KeyStrategy) -> String {
        let ip_key = || match self.ip {
            Some(ip) => format!("ip:{}", ip),
            None => "ip:unknown".to_string(),
        };

        match strategy {
            KeyStrategy::Ip => ip_key(),
            KeyStrategy::User => match &self.user_id {
                Some(user_id) => format!("user:{}", user_id),
                None => "user:anonymous".to_string(),
            },
            KeyStrategy::UserOrIp => match &self.user_id {
                Some(user_id) => format!("user:{}", user_id),
                None => ip_key(),
            },
            KeyStrategy::Global => "global".to_string(),
        }
    }
}

/// Result of a rate limit check. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_at: i64,
    },
    Denied {
        limit: u32,
        reset_at: i64,
        /// Seconds until a slot frees up (always > 0)
        retry_after: u64,
    },
    /// Exempt path/user agent, or limiting disabled; the store was not touched
    Exempt,
    /// Store failed, timed out or the check was cancelled; request allowed
    FailedOpen { limit: u32 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateLimitResult::Denied { .. })
    }

    pub fn remaining(&self) -> Option<u32> {
        match self {
            RateLimitResult::Allowed { remaining, .. } => Some(*remaining),
            RateLimitResult::Denied { .. } => Some(0),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            RateLimitResult::Denied { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

enum Failure {
    Store(StoreError),
    Timeout,
    Cancelled,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Store(e) => write!(f, "{}", e),
            Failure::Timeout => write!(f, "store call timed out"),
            Failure::Cancelled => write!(f, "check cancelled"),
        }
    }
}

/// Applies the configured rules against a `SlidingWindowStore`.
///
/// A request is admitted when fewer than `limit` entries fall inside the
/// trailing window. Rejected requests remove their own entry so that
/// hammering at the limit never shrinks the quota. Any store failure fails
/// open.
pub struct SlidingWindowLimiter {
    store: Arc<dyn SlidingWindowStore>,
    config: RateLimitConfig,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn SlidingWindowStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Housekeeping for stores without native expiry
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired(now_ms())
    }

    pub fn rule(&self, kind: RuleKind) -> &RateLimitRule {
        match kind {
            RuleKind::Http => &self.config.http,
            RuleKind::WsConnect => &self.config.ws_connect,
            RuleKind::WsMessage => &self.config.ws_message,
        }
    }

    /// Exempt by path prefix or user-agent substring
    pub fn is_exempt(&self, identity: &RequestIdentity) -> bool {
        let path_exempt = identity.path.as_deref().is_some_and(|path| {
            self.config
                .exempt_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        });
        let agent_exempt = identity.user_agent.as_deref().is_some_and(|agent| {
            self.config
                .exempt_user_agents
                .iter()
                .any(|needle| agent.contains(needle.as_str()))
        });
        path_exempt || agent_exempt
    }

    pub async fn check(&self, kind: RuleKind, identity: &RequestIdentity) -> RateLimitResult {
        let rule = self.rule(kind).clone();
        self.check_rule(kind.as_str(), &rule, identity, now_ms(), None)
            .await
    }

    /// Like `check`, abandoned (and failed open) when `cancel` fires
    pub async fn check_cancellable(
        &self,
        kind: RuleKind,
        identity: &RequestIdentity,
        cancel: &CancellationToken,
    ) -> RateLimitResult {
        let rule = self.rule(kind).clone();
        self.check_rule(kind.as_str(), &rule, identity, now_ms(), Some(cancel))
            .await
    }

    /// Evaluate an arbitrary rule at a given instant
    pub async fn check_rule(
        &self,
        name: &str,
        rule: &RateLimitRule,
        identity: &RequestIdentity,
        now_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Exempt;
        }
        if self.is_exempt(identity) {
            RateLimitMetrics::record_exempt(name);
            return RateLimitResult::Exempt;
        }

        let key = format!(
            "{}:{}:{}",
            self.config.redis_prefix,
            name,
            identity.key_for(rule.strategy)
        );
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let window_ms = rule.window_ms();

        let sample = match self
            .guarded(self.store.record(&key, now_ms, window_ms, &member), cancel)
            .await
        {
            Ok(sample) => sample,
            Err(failure) => {
                tracing::warn!(
                    rule = name,
                    key = %key,
                    backend = self.store.backend_name(),
                    error = %failure,
                    "Rate limit store unavailable, failing open"
                );
                RateLimitMetrics::record_fail_open(name);
                return RateLimitResult::FailedOpen { limit: rule.limit };
            }
        };

        let WindowSample {
            count_before,
            oldest_ms,
        } = sample;
        let reset_at_ms = oldest_ms + window_ms;

        if count_before + 1 > rule.limit as u64 {
            // a rejected request must not consume quota
            if let Err(failure) = self.guarded(self.store.remove(&key, &member), cancel).await {
                tracing::warn!(
                    rule = name,
                    key = %key,
                    error = %failure,
                    "Failed to remove rejected rate limit entry"
                );
            }

            let retry_after = ((reset_at_ms - now_ms).max(0) as u64).div_ceil(1000).max(1);
            RateLimitMetrics::record_denied(name);
            tracing::debug!(rule = name, key = %key, retry_after = retry_after, "Rate limit exceeded");

            return RateLimitResult::Denied {
                limit: rule.limit,
                reset_at: ms_to_secs_ceil(reset_at_ms),
                retry_after,
            };
        }

        RateLimitMetrics::record_allowed(name);
        RateLimitResult::Allowed {
            limit: rule.limit,
            remaining: (rule.limit as u64)
                .saturating_sub(count_before + 1)
                .min(u32::MAX as u64) as u32,
            reset_at: ms_to_secs_ceil(reset_at_ms),
        }
    }

    async fn guarded<T, F>(&self, call: F, cancel: Option<&CancellationToken>) -> Result<T, Failure>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let timeout = Duration::from_millis(self.config.store_timeout_ms);
        let bounded = async {
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Failure::Store(e)),
                Err(_) => Err(Failure::Timeout),
            }
        };

        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(Failure::Cancelled),
                result = bounded => result,
            },
            None => bounded.await,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ms_to_secs_ceil(ms: i64) -> i64 {
    (ms + 999).div_euclid(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemorySlidingWindowStore;
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl SlidingWindowStore for FailingStore {
        fn backend_name(&self) -> &'static str {
            "failing"
        }

        async fn record(&self, _: &str, _: i64, _: i64, _: &str) -> Result<WindowSample, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn remove(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl SlidingWindowStore for StalledStore {
        fn backend_name(&self) -> &'static str {
            "stalled"
        }

        async fn record(&self, _: &str, _: i64, _: i64, _: &str) -> Result<WindowSample, StoreError> {
            std::future::pending().await
        }

        async fn remove(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn enabled() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            store_timeout_ms: 50,
            ..Default::default()
        }
    }

    fn memory_limiter() -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(Arc::new(MemorySlidingWindowStore::new()), enabled())
    }

    fn ip_rule(limit: u32, window_seconds: u64) -> RateLimitRule {
        RateLimitRule::new(limit, window_seconds, KeyStrategy::Ip)
    }

    fn client() -> RequestIdentity {
        RequestIdentity::ip("10.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn test_five_per_minute_by_ip() {
        let limiter = memory_limiter();
        let rule = ip_rule(5, 60);
        let t0 = 1_700_000_000_000;

        for (i, expected) in [4u32, 3, 2, 1, 0].into_iter().enumerate() {
            let result = limiter
                .check_rule("test", &rule, &client(), t0 + i as i64 * 100, None)
                .await;
            assert_eq!(result.remaining(), Some(expected));
            assert!(result.is_allowed());
        }

        let sixth = limiter.check_rule("test", &rule, &client(), t0 + 900, None).await;
        assert!(!sixth.is_allowed());
        assert!(sixth.retry_after().unwrap() > 0);

        let later = limiter
            .check_rule("test", &rule, &client(), t0 + 61_000, None)
            .await;
        assert!(later.is_allowed());
    }

    #[tokio::test]
    async fn test_rejections_do_not_consume_quota() {
        let limiter = memory_limiter();
        let rule = ip_rule(2, 10);
        let t0 = 0;

        limiter.check_rule("test", &rule, &client(), t0, None).await;
        limiter.check_rule("test", &rule, &client(), t0 + 1_000, None).await;
        for i in 0..20 {
            let r = limiter
                .check_rule("test", &rule, &client(), t0 + 2_000 + i * 100, None)
                .await;
            assert!(!r.is_allowed());
        }

        // first entry leaves the window; exactly one slot frees up
        assert!(limiter
            .check_rule("test", &rule, &client(), t0 + 10_500, None)
            .await
            .is_allowed());
        assert!(!limiter
            .check_rule("test", &rule, &client(), t0 + 10_600, None)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_retry_after_tracks_oldest_entry() {
        let limiter = memory_limiter();
        let rule = ip_rule(1, 60);

        limiter.check_rule("test", &rule, &client(), 0, None).await;
        let denied = limiter.check_rule("test", &rule, &client(), 45_000, None).await;
        assert_eq!(
            denied,
            RateLimitResult::Denied {
                limit: 1,
                reset_at: 60,
                retry_after: 15
            }
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = memory_limiter();
        let rule = ip_rule(1, 60);
        let other = RequestIdentity::ip("10.0.0.2".parse().unwrap());

        assert!(limiter.check_rule("test", &rule, &client(), 0, None).await.is_allowed());
        assert!(limiter.check_rule("test", &rule, &other, 0, None).await.is_allowed());
        assert!(!limiter.check_rule("test", &rule, &client(), 1, None).await.is_allowed());
    }

    #[test]
    fn test_key_strategies() {
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        let both = RequestIdentity::user("u1").with_ip(Some(ip));
        let anonymous = RequestIdentity::ip(ip);

        assert_eq!(both.key_for(KeyStrategy::Ip), "ip:192.168.1.1");
        assert_eq!(both.key_for(KeyStrategy::User), "user:u1");
        assert_eq!(both.key_for(KeyStrategy::UserOrIp), "user:u1");
        assert_eq!(anonymous.key_for(KeyStrategy::UserOrIp), "ip:192.168.1.1");
        assert_eq!(anonymous.key_for(KeyStrategy::Global), "global");
    }

    #[tokio::test]
    async fn test_exempt_before_store_access() {
        let limiter = SlidingWindowLimiter::new(Arc::new(FailingStore), enabled());

        let health = client().with_path("/health/live");
        assert_eq!(limiter.check(RuleKind::Http, &health).await, RateLimitResult::Exempt);

        let probe = client()
            .with_path("/api/v1/events")
            .with_user_agent(Some("kube-probe/1.29".to_string()));
        assert_eq!(limiter.check(RuleKind::Http, &probe).await, RateLimitResult::Exempt);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = SlidingWindowLimiter::new(Arc::new(FailingStore), enabled());
        let result = limiter.check(RuleKind::Http, &client()).await;
        assert!(result.is_allowed());
        assert!(matches!(result, RateLimitResult::FailedOpen { .. }));
    }

    #[tokio::test]
    async fn test_store_timeout_fails_open() {
        let limiter = SlidingWindowLimiter::new(Arc::new(StalledStore), enabled());
        let result = limiter.check(RuleKind::WsConnect, &client()).await;
        assert!(matches!(result, RateLimitResult::FailedOpen { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_check_fails_open() {
        let mut config = enabled();
        config.store_timeout_ms = 60_000;
        let limiter = SlidingWindowLimiter::new(Arc::new(StalledStore), config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = limiter
            .check_cancellable(RuleKind::WsMessage, &RequestIdentity::user("u1"), &cancel)
            .await;
        assert!(matches!(result, RateLimitResult::FailedOpen { .. }));
    }

    #[tokio::test]
    async fn test_disabled_limiter_never_touches_store() {
        let limiter = SlidingWindowLimiter::new(Arc::new(FailingStore), RateLimitConfig::default());
        assert_eq!(limiter.check(RuleKind::Http, &client()).await, RateLimitResult::Exempt);
    }
}
