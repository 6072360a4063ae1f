//! In-process presence store for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::PresenceStore;
use crate::error::{AppError, AppResult};
use crate::models::{OnlineUser, PresenceUpsert, UpsertOutcome};

#[derive(Debug, Clone)]
struct MemoryRow {
    user_name: String,
    last_seen: DateTime<Utc>,
    created_at: DateTime<Utc>,
    /// Insertion sequence; breaks `created_at` ties.
    seq: u64,
}

/// HashMap-backed store. The whole-map lock makes every operation atomic.
#[derive(Debug)]
pub struct MemoryPresenceStore {
    rows: RwLock<HashMap<(String, String), MemoryRow>>,
    next_seq: AtomicU64,
    schema_ready: AtomicBool,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            schema_ready: AtomicBool::new(true),
        }
    }

    /// Simulate a missing relation (readiness check fails).
    pub fn set_schema_ready(&self, ready: bool) {
        self.schema_ready.store(ready, Ordering::SeqCst);
    }

    /// Total rows across all workspaces.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a row exists for the session, regardless of age.
    pub fn contains(&self, workspace_id: &str, user_session: &str) -> bool {
        self.rows
            .read()
            .contains_key(&(workspace_id.to_string(), user_session.to_string()))
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn check_schema(&self) -> AppResult<()> {
        if self.schema_ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::SchemaNotReady(
                "Database tables not found. Please run sql/workspace_presence.sql".to_string(),
            ))
        }
    }

    async fn upsert(&self, row: PresenceUpsert<'_>) -> AppResult<UpsertOutcome> {
        let key = (row.workspace_id.to_string(), row.user_session.to_string());
        let mut rows = self.rows.write();
        if let Some(existing) = rows.get_mut(&key) {
            existing.user_name = row.user_name.to_string();
            existing.last_seen = row.last_seen;
            return Ok(UpsertOutcome::Updated);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        rows.insert(
            key,
            MemoryRow {
                user_name: row.user_name.to_string(),
                last_seen: row.last_seen,
                created_at: row.last_seen,
                seq,
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn list_seen_since(
        &self,
        workspace_id: &str,
        cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<OnlineUser>> {
        let rows = self.rows.read();
        let mut matching: Vec<(&String, &MemoryRow)> = rows
            .iter()
            .filter(|((ws, _), row)| ws == workspace_id && row.last_seen >= cutoff)
            .map(|((_, session), row)| (session, row))
            .collect();
        matching.sort_by_key(|(_, row)| (row.created_at, row.seq));
        Ok(matching
            .into_iter()
            .map(|(session, row)| OnlineUser::new(session.clone(), row.user_name.clone()))
            .collect())
    }

    async fn delete_seen_before(
        &self,
        workspace_id: &str,
        cutoff: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|(ws, _), row| !(ws == workspace_id && row.last_seen < cutoff));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_session(&self, workspace_id: &str, user_session: &str) -> AppResult<u64> {
        let removed = self
            .rows
            .write()
            .remove(&(workspace_id.to_string(), user_session.to_string()));
        Ok(u64::from(removed.is_some()))
    }

    async fn delete_all_seen_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, row| row.last_seen >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}
