use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::WebSocketConfig;
use crate::hub::Hub;
use crate::metrics::HeartbeatMetrics;
use crate::ratelimit::SlidingWindowLimiter;

/// Background task for heartbeats, idle-connection cleanup and rate limit
/// store housekeeping
pub struct HeartbeatTask {
    config: WebSocketConfig,
    hub: Arc<Hub>,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    shutdown: CancellationToken,
}

impl HeartbeatTask {
    pub fn new(config: WebSocketConfig, hub: Arc<Hub>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            hub,
            limiter: None,
            shutdown,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<SlidingWindowLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub async fn run(self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval.max(1));
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup(connection_timeout);
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    fn send_heartbeats(&self) {
        let start = Instant::now();
        let queued = self.hub.send_heartbeats();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        HeartbeatMetrics::record_duration_ms(elapsed_ms);
        tracing::debug!(queued = queued, elapsed_ms = elapsed_ms, "Heartbeat round completed");
    }

    fn cleanup(&self, timeout_secs: u64) {
        let removed = self.hub.disconnect_stale(timeout_secs);
        if removed > 0 {
            HeartbeatMetrics::record_stale(removed);
            tracing::info!(
                removed = removed,
                timeout_secs = timeout_secs,
                "Cleaned up stale connections"
            );
        }

        if let Some(ref limiter) = self.limiter {
            let purged = limiter.purge_expired();
            if purged > 0 {
                tracing::debug!(purged = purged, "Purged expired rate limit windows");
            }
        }
    }
}
