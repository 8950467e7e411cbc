use anyhow::{Context, Result};
use futures::stream::StreamExt;
use redis::Client as RedisClient;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::config::RelayConfig;
use courier_core::models::NotificationPayload;

use crate::registry::ConnectionRegistry;

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Pub/Sub relay bridging broker channels to registered sessions.
///
/// Subscribes to the per-user channel pattern and the fixed admin
/// channel, decodes each inbound message as a JSON object, and routes
/// it through the [`ConnectionRegistry`]. Delivery is best-effort: a
/// message for an identity with no live session is dropped.
pub struct NotificationRelay {
    redis_client: RedisClient,
    registry: Arc<ConnectionRegistry>,
    config: RelayConfig,
    cancel_token: CancellationToken,
}

/// Describes how a subscriber session ended, deciding what happens next.
#[derive(Debug, PartialEq, Eq)]
enum SessionExit {
    /// Cancellation was requested; the relay unsubscribes and returns.
    Cancelled,
    /// The message stream ended (broker connection lost); the relay
    /// reconnects with backoff.
    Disconnected,
}

impl NotificationRelay {
    pub fn new(
        redis_url: &str,
        registry: Arc<ConnectionRegistry>,
        config: RelayConfig,
    ) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

        Ok(Self {
            redis_client,
            registry,
            config,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Shut down the relay (unblocks the receive loop)
    pub fn shutdown(&self) {
        info!("Shutting down notification relay");
        self.cancel_token.cancel();
    }

    /// Run the relay until cancelled.
    ///
    /// The initial subscription must be confirmed before any message is
    /// processed; if either subscribe fails the error propagates and the
    /// run loop is never entered. After a healthy session drops, the
    /// relay reconnects with capped exponential backoff.
    pub async fn run(&self) -> Result<()> {
        let pubsub = self.subscribe().await?;
        info!(
            pattern = %self.config.user_channel_pattern(),
            admin_channel = %self.config.admin_channel,
            "Notification relay subscribed"
        );

        let mut session = pubsub;
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            match self.pump_messages(session).await {
                SessionExit::Cancelled => {
                    info!("Notification relay stopped");
                    return Ok(());
                }
                SessionExit::Disconnected => {
                    // The connection was healthy before it dropped.
                    error!(
                        backoff_secs = INITIAL_BACKOFF_SECS,
                        "Relay subscription stream ended, reconnecting"
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
            }

            // Reconnect with backoff until cancelled
            session = loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        info!("Notification relay cancelled during reconnect");
                        return Ok(());
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                match self.subscribe().await {
                    Ok(pubsub) => {
                        info!("Notification relay resubscribed");
                        break pubsub;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Relay failed to resubscribe, retrying after backoff"
                        );
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    }
                }
            };
        }
    }

    /// Subscribe to both notification channels.
    ///
    /// Both subscriptions must be confirmed; a partial subscription is
    /// treated as a failure of the whole attempt.
    async fn subscribe(&self) -> Result<redis::aio::PubSub> {
        let mut pubsub = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        .context("Timed out getting Redis Pub/Sub connection")?
        .context("Failed to get Redis Pub/Sub connection")?;

        let pattern = self.config.user_channel_pattern();
        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.psubscribe(&pattern),
        )
        .await
        .with_context(|| format!("Timed out subscribing to {pattern}"))?
        .with_context(|| format!("Failed to subscribe to {pattern}"))?;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(&self.config.admin_channel),
        )
        .await
        .with_context(|| format!("Timed out subscribing to {}", self.config.admin_channel))?
        .with_context(|| format!("Failed to subscribe to {}", self.config.admin_channel))?;

        Ok(pubsub)
    }

    /// Process messages until the stream ends or cancellation.
    ///
    /// On cancellation both subscriptions are released before returning
    /// so the broker drops its subscriber state for this connection.
    async fn pump_messages(&self, mut pubsub: redis::aio::PubSub) -> SessionExit {
        let exit = {
            let mut stream = pubsub.on_message();

            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => break SessionExit::Cancelled,
                    msg = stream.next() => match msg {
                        Some(msg) => self.handle_message(&msg),
                        None => break SessionExit::Disconnected,
                    }
                }
            }
        };

        if exit == SessionExit::Cancelled {
            let pattern = self.config.user_channel_pattern();
            if let Err(e) = pubsub.punsubscribe(&pattern).await {
                warn!(error = %e, pattern = %pattern, "Failed to punsubscribe");
            }
            if let Err(e) = pubsub.unsubscribe(&self.config.admin_channel).await {
                warn!(
                    error = %e,
                    channel = %self.config.admin_channel,
                    "Failed to unsubscribe"
                );
            }
        }

        exit
    }

    fn handle_message(&self, msg: &redis::Msg) {
        let channel = msg.get_channel_name().to_string();

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload encoding");
                return;
            }
        };

        self.route_message(&channel, &payload);
    }

    /// Decode and route one inbound message.
    ///
    /// Malformed payloads and channels outside the contract are logged
    /// and discarded; one bad message never stops processing of the
    /// next.
    fn route_message(&self, channel: &str, payload: &str) {
        let payload = match payload.parse::<NotificationPayload>() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Discarding undecodable payload");
                return;
            }
        };

        if channel == self.config.admin_channel {
            let sent = self.registry.broadcast_to_admins(&payload);
            debug!(channel = %channel, sent = sent, "Admin broadcast delivered");
            return;
        }

        match extract_identity(channel, &self.config.user_channel_prefix) {
            Some(identity) => {
                let delivered = self.registry.send_to_user(identity, payload);
                debug!(
                    channel = %channel,
                    identity = %identity,
                    delivered = delivered,
                    "User notification routed"
                );
            }
            None => {
                debug!(channel = %channel, "Channel outside notification contract, dropping");
            }
        }
    }
}

/// Extract the target identity from a per-user channel name.
///
/// Returns `None` when the channel does not carry the expected prefix
/// or the identity part is empty.
fn extract_identity<'a>(channel: &'a str, prefix: &str) -> Option<&'a str> {
    match channel.strip_prefix(prefix) {
        Some("") | None => None,
        Some(identity) => Some(identity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Audience;

    fn relay_with_registry() -> (NotificationRelay, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = NotificationRelay::new(
            "redis://127.0.0.1:6379",
            registry.clone(),
            RelayConfig::default(),
        )
        .unwrap();
        (relay, registry)
    }

    #[test]
    fn test_extract_identity() {
        assert_eq!(
            extract_identity("notification:user:abc123", "notification:user:"),
            Some("abc123")
        );
        assert_eq!(
            extract_identity("notification:user:", "notification:user:"),
            None
        );
        assert_eq!(extract_identity("other:channel", "notification:user:"), None);
        assert_eq!(
            extract_identity("notification:admin", "notification:user:"),
            None
        );
    }

    #[tokio::test]
    async fn test_route_user_message() {
        let (relay, registry) = relay_with_registry();
        let mut rx = registry.register(Audience::User, "abc123");

        relay.route_message("notification:user:abc123", r#"{"msg":"hi"}"#);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.get("msg").and_then(|v| v.as_str()), Some("hi"));
    }

    #[tokio::test]
    async fn test_route_admin_message() {
        let (relay, registry) = relay_with_registry();
        let mut admin_rx = registry.register(Audience::Admin, "a1");
        let mut user_rx = registry.register(Audience::User, "u1");

        relay.route_message("notification:admin", r#"{"alert":"x"}"#);

        assert!(admin_rx.recv().await.is_some());
        assert!(user_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (relay, registry) = relay_with_registry();
        let mut rx = registry.register(Audience::User, "u1");

        relay.route_message("notification:user:u1", "{not json");
        relay.route_message("notification:user:u1", r#"["array","payload"]"#);
        assert!(rx.try_recv().is_err());

        // The next valid message on the same channel still goes through.
        relay.route_message("notification:user:u1", r#"{"msg":"ok"}"#);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unmatched_channel_is_dropped() {
        let (relay, registry) = relay_with_registry();
        let mut user_rx = registry.register(Audience::User, "u1");
        let mut admin_rx = registry.register(Audience::Admin, "a1");

        relay.route_message("some:other:channel", r#"{"msg":"hi"}"#);

        assert!(user_rx.try_recv().is_err());
        assert!(admin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_for_unregistered_identity_is_silent() {
        let (relay, _registry) = relay_with_registry();
        // No session registered; routing is a no-op, not an error.
        relay.route_message("notification:user:ghost", r#"{"msg":"hi"}"#);
    }

    // Integration tests require Redis running
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_relay_end_to_end() {
        let redis_url = "redis://127.0.0.1:6379";
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = Arc::new(
            NotificationRelay::new(redis_url, registry.clone(), RelayConfig::default()).unwrap(),
        );

        let mut rx = registry.register(Audience::User, "u1");

        let relay_task = relay.clone();
        let handle = tokio::spawn(async move { relay_task.run().await });

        // Give the subscription time to establish
        tokio::time::sleep(Duration::from_millis(500)).await;

        let client = redis::Client::open(redis_url).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let _: usize = redis::AsyncCommands::publish(
            &mut conn,
            "notification:user:u1",
            r#"{"msg":"hi"}"#,
        )
        .await
        .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.get("msg").and_then(|v| v.as_str()), Some("hi"));

        relay.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
