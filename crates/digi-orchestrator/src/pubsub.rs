// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel-based notification bus.
//!
//! Used to wake idle workers when a job is enqueued and to stream deployment
//! progress. Delivery is best-effort: subscribers that are not connected
//! miss messages, so nothing may depend on a message arriving.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use crate::error::Result;

/// Messages received on a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

/// Channel name builders.
pub struct Channels;

impl Channels {
    /// Channel announcing newly enqueued jobs.
    pub fn job_new() -> &'static str {
        "jobs:new"
    }

    /// `deployment:{deployment_id}`
    pub fn deployment(deployment_id: &str) -> String {
        format!("deployment:{}", deployment_id)
    }

    /// `logs:{service_id}:{container_id}`
    pub fn container_logs(service_id: &str, container_id: &str) -> String {
        format!("logs:{}:{}", service_id, container_id)
    }
}

/// Publish/subscribe bus carrying JSON messages.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `message` on `channel`.
    async fn publish(&self, channel: &str, message: &Value) -> Result<()>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}

// ============================================================================
// In-memory backend
// ============================================================================

const CHANNEL_CAPACITY: usize = 256;

/// Process-local bus on `tokio::sync::broadcast`.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>,
}

impl MemoryPubSub {
    /// Bus with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, message: &Value) -> Result<()> {
        // No receivers is not an error.
        let _ = self.sender(channel).await.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let receiver = self.sender(channel).await.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Redis backend
// ============================================================================

/// Redis-backed bus. Each subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSub {
    /// Connect to `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, message: &Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(message)?;
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to read pub/sub payload");
                    return None;
                }
            };
            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(error = %e, "Dropping non-JSON pub/sub message");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_pubsub_delivers_to_subscribers() {
        let bus = MemoryPubSub::new();
        let mut a = bus.subscribe(Channels::job_new()).await.unwrap();
        let mut b = bus.subscribe(Channels::job_new()).await.unwrap();

        bus.publish(Channels::job_new(), &json!({"jobId": "j1"}))
            .await
            .unwrap();

        assert_eq!(a.next().await, Some(json!({"jobId": "j1"})));
        assert_eq!(b.next().await, Some(json!({"jobId": "j1"})));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryPubSub::new();
        bus.publish(&Channels::deployment("d1"), &json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryPubSub::new();
        let mut deployments = bus.subscribe(&Channels::deployment("d1")).await.unwrap();

        bus.publish(&Channels::deployment("d2"), &json!({"n": 2}))
            .await
            .unwrap();
        bus.publish(&Channels::deployment("d1"), &json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(deployments.next().await, Some(json!({"n": 1})));
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Channels::container_logs("s1", "c1"), "logs:s1:c1");
        assert_eq!(Channels::deployment("d1"), "deployment:d1");
    }
}
