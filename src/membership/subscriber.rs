//! Pub/Sub listener for membership-changed signals

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::metrics::RedisMetrics;
use crate::redis::ExponentialBackoff;

/// Signal published by the circle service when a circle's members change.
/// Without `user_ids`, every connected user related to the circle is
/// re-resolved.
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipChanged {
    pub circle_id: String,
    #[serde(default)]
    pub user_ids: Option<Vec<String>>,
}

pub struct MembershipSubscriber {
    client: redis::Client,
    channel: String,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
}

impl MembershipSubscriber {
    pub fn new(client: redis::Client, channel: String, hub: Arc<Hub>) -> Self {
        Self {
            client,
            channel,
            hub,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe until shut down, reconnecting with backoff
    pub async fn run(&self) {
        let mut backoff = ExponentialBackoff::new();
        tracing::info!(channel = %self.channel, "Starting membership subscriber");

        loop {
            match self.subscription_loop(&mut backoff).await {
                Ok(()) => {
                    tracing::info!("Membership subscriber stopped");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Membership subscription error, reconnecting"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn subscription_loop(&self, backoff: &mut ExponentialBackoff) -> anyhow::Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        backoff.reset();
        tracing::info!(channel = %self.channel, "Membership subscription established");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("membership message stream ended");
                    };
                    RedisMetrics::record_message_received();
                    match msg.get_payload::<String>() {
                        Ok(payload) => self.handle_payload(&payload).await,
                        Err(e) => tracing::warn!(error = %e, "Failed to get message payload"),
                    }
                }
            }
        }
    }

    async fn handle_payload(&self, payload: &str) {
        let signal: MembershipChanged = match serde_json::from_str(payload) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, payload = %payload, "Malformed membership-changed message");
                return;
            }
        };

        let outcome = self
            .hub
            .membership_changed(&signal.circle_id, signal.user_ids)
            .await;
        tracing::debug!(
            circle_id = %signal.circle_id,
            users = outcome.users,
            subscribed = outcome.subscribed,
            unsubscribed = outcome.unsubscribed,
            "Membership change applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        let signal: MembershipChanged =
            serde_json::from_str(r#"{"circle_id":"family","user_ids":["alice"]}"#).unwrap();
        assert_eq!(signal.circle_id, "family");
        assert_eq!(signal.user_ids, Some(vec!["alice".to_string()]));

        let signal: MembershipChanged = serde_json::from_str(r#"{"circle_id":"family"}"#).unwrap();
        assert!(signal.user_ids.is_none());

        assert!(serde_json::from_str::<MembershipChanged>(r#"{"user_ids":[]}"#).is_err());
    }
}
