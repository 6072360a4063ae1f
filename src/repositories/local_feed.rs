//! In-process change feed: one broadcast channel per workspace.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChangeFeed, FEED_CAPACITY};
use crate::error::AppResult;
use crate::models::PresenceChange;

/// Feed for a single process; every subscriber of a workspace shares one sender.
#[derive(Debug, Default)]
pub struct LocalChangeFeed {
    channels: RwLock<HashMap<String, broadcast::Sender<PresenceChange>>>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a workspace's sender; current receivers observe the feed closing.
    pub fn close(&self, workspace_id: &str) {
        self.channels.write().remove(workspace_id);
    }

    /// Workspaces that currently have a sender.
    pub fn topic_count(&self) -> usize {
        self.channels.read().len()
    }
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn publish(&self, change: &PresenceChange) -> AppResult<()> {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(&change.workspace_id) {
            // No receivers is fine: nobody is watching this workspace.
            let count = tx.send(change.clone()).unwrap_or(0);
            debug!(workspace_id = %change.workspace_id, count, "change published");
        }
        Ok(())
    }

    async fn subscribe(&self, workspace_id: &str) -> AppResult<broadcast::Receiver<PresenceChange>> {
        let mut channels = self.channels.write();
        let tx = channels
            .entry(workspace_id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0);
        Ok(tx.subscribe())
    }

    fn release(&self, workspace_id: &str) {
        let mut channels = self.channels.write();
        if channels
            .get(workspace_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(workspace_id);
            debug!(workspace_id = %workspace_id, "local topic released");
        }
    }
}
