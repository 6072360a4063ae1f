//! Redis pub/sub change feed: one Redis subscription per watched workspace, fanned out locally.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChangeFeed, FEED_CAPACITY};
use crate::error::{AppError, AppResult};
use crate::models::PresenceChange;

const CHANNEL_PREFIX: &str = "presence:workspace:";

fn channel_key(workspace_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, workspace_id)
}

/// A workspace's live Redis subscription. Dropping it closes the pub/sub connection.
struct Topic {
    id: u64,
    tx: broadcast::Sender<PresenceChange>,
    forwarder: JoinHandle<()>,
}

impl Drop for Topic {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

type Topics = Arc<RwLock<HashMap<String, Topic>>>;

/// Redis-backed change feed shared by every view hosted in this process.
#[derive(Clone)]
pub struct RedisChangeFeed {
    client: Arc<redis::Client>,
    /// workspace_id -> topic fed by that workspace's Redis subscription.
    topics: Topics,
    next_topic: Arc<AtomicU64>,
}

impl RedisChangeFeed {
    /// Create feed from Redis URL.
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_topic: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Get a multiplexed connection for commands.
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Workspaces with an open Redis subscription.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Open a dedicated pub/sub connection for one workspace and forward decoded changes.
    async fn open_topic(&self, workspace_id: &str) -> AppResult<Topic> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel_key(workspace_id)).await?;
        info!(workspace_id = %workspace_id, "subscribed to redis channel");

        let id = self.next_topic.fetch_add(1, Ordering::Relaxed);
        let (tx, _rx) = broadcast::channel(FEED_CAPACITY);
        let tx_fwd = tx.clone();
        let topics = Arc::clone(&self.topics);
        let workspace = workspace_id.to_string();

        let forwarder = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<PresenceChange>(&payload) {
                    Ok(change) => {
                        let _ = tx_fwd.send(change);
                    }
                    Err(e) => debug!(workspace_id = %workspace, error = %e, "ignoring malformed change"),
                }
            }
            // Connection lost: forget this topic so receivers see the feed close.
            warn!(workspace_id = %workspace, "redis subscription dropped");
            let mut topics = topics.write();
            if topics.get(&workspace).is_some_and(|t| t.id == id) {
                topics.remove(&workspace);
            }
        });

        Ok(Topic { id, tx, forwarder })
    }
}

#[async_trait]
impl ChangeFeed for RedisChangeFeed {
    async fn publish(&self, change: &PresenceChange) -> AppResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(change)?;
        let count: u64 = conn.publish(channel_key(&change.workspace_id), payload).await?;
        debug!(workspace_id = %change.workspace_id, count, "published");
        Ok(())
    }

    async fn subscribe(&self, workspace_id: &str) -> AppResult<broadcast::Receiver<PresenceChange>> {
        let existing = self.topics.read().get(workspace_id).map(|t| t.tx.subscribe());
        if let Some(rx) = existing {
            return Ok(rx);
        }

        let topic = self.open_topic(workspace_id).await?;
        let mut topics = self.topics.write();
        if let Some(current) = topics.get(workspace_id) {
            // Another view opened the workspace meanwhile; ours is dropped and closes.
            return Ok(current.tx.subscribe());
        }
        let rx = topic.tx.subscribe();
        topics.insert(workspace_id.to_string(), topic);
        Ok(rx)
    }

    fn release(&self, workspace_id: &str) {
        let mut topics = self.topics.write();
        if topics
            .get(workspace_id)
            .is_some_and(|t| t.tx.receiver_count() == 0)
        {
            topics.remove(workspace_id);
            info!(workspace_id = %workspace_id, "redis channel released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_is_namespaced() {
        assert_eq!(channel_key("abc"), "presence:workspace:abc");
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(RedisChangeFeed::new("not a url").is_err());
    }

    #[test]
    fn release_of_unknown_workspace_is_noop() {
        let feed = RedisChangeFeed::new("redis://127.0.0.1/").unwrap();
        feed.release("nobody");
        assert_eq!(feed.topic_count(), 0);
    }
}
