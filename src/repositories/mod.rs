//! Storage seams: the presence store and the change feed, with their backends.

mod local_feed;
mod memory_store;
mod redis_repo;

pub use local_feed::LocalChangeFeed;
pub use memory_store::MemoryPresenceStore;
pub use redis_repo::RedisChangeFeed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::AppResult;
use crate::models::{OnlineUser, PresenceChange, PresenceUpsert, UpsertOutcome};

/// Capacity of every per-workspace change broadcast.
pub(crate) const FEED_CAPACITY: usize = 64;

/// Persistent relation of presence rows keyed by `(workspace_id, user_session)`.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Probe that the presence relation exists.
    async fn check_schema(&self) -> AppResult<()>;

    /// Insert or refresh a row. Must be atomic on the composite key.
    async fn upsert(&self, row: PresenceUpsert<'_>) -> AppResult<UpsertOutcome>;

    /// Rows of a workspace with `last_seen >= cutoff`, oldest first by creation.
    async fn list_seen_since(
        &self,
        workspace_id: &str,
        cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<OnlineUser>>;

    /// Delete rows of a workspace with `last_seen < cutoff`; returns rows removed.
    async fn delete_seen_before(&self, workspace_id: &str, cutoff: DateTime<Utc>)
        -> AppResult<u64>;

    /// Delete one session's row; returns rows removed (0 or 1).
    async fn delete_session(&self, workspace_id: &str, user_session: &str) -> AppResult<u64>;

    /// Delete rows of every workspace with `last_seen < cutoff`.
    async fn delete_all_seen_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}

/// Push channel for presence changes, filtered per workspace.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn publish(&self, change: &PresenceChange) -> AppResult<()>;

    /// Receiver of every change published for the workspace from now on.
    async fn subscribe(&self, workspace_id: &str) -> AppResult<broadcast::Receiver<PresenceChange>>;

    /// Tear down the workspace's topic if no receiver is left. Call after dropping a receiver.
    fn release(&self, workspace_id: &str);
}
