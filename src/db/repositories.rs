//! `workspace_presence` queries (see `sql/workspace_presence.sql`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::{OnlineUser, PresenceUpsert, UpsertOutcome};
use crate::repositories::PresenceStore;

#[derive(Debug, FromRow)]
struct OnlineRow {
    user_session: String,
    user_name: String,
}

/// Presence store over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgPresenceStore {
    pool: DbPool,
}

impl PgPresenceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn check_schema(&self) -> AppResult<()> {
        sqlx::query("SELECT id FROM workspace_presence LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::from_schema_check)?;
        Ok(())
    }

    async fn upsert(&self, row: PresenceUpsert<'_>) -> AppResult<UpsertOutcome> {
        // created_at takes the caller's clock like last_seen, and only on insert.
        // xmax = 0 only for a freshly inserted tuple.
        let (inserted,): (bool,) = sqlx::query_as(
            r#"
            INSERT INTO workspace_presence (workspace_id, user_session, user_name, last_seen, created_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (workspace_id, user_session)
            DO UPDATE SET user_name = EXCLUDED.user_name, last_seen = EXCLUDED.last_seen
            RETURNING (xmax = 0)
            "#,
        )
        .bind(row.workspace_id)
        .bind(row.user_session)
        .bind(row.user_name)
        .bind(row.last_seen)
        .fetch_one(&self.pool)
        .await?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn list_seen_since(
        &self,
        workspace_id: &str,
        cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<OnlineUser>> {
        let rows = sqlx::query_as::<_, OnlineRow>(
            r#"
            SELECT user_session, user_name
            FROM workspace_presence
            WHERE workspace_id = $1 AND last_seen >= $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(workspace_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| OnlineUser::new(r.user_session, r.user_name))
            .collect())
    }

    async fn delete_seen_before(
        &self,
        workspace_id: &str,
        cutoff: DateTime<Utc>,
    ) -> AppResult<u64> {
        let r = sqlx::query("DELETE FROM workspace_presence WHERE workspace_id = $1 AND last_seen < $2")
            .bind(workspace_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }

    async fn delete_session(&self, workspace_id: &str, user_session: &str) -> AppResult<u64> {
        let r = sqlx::query(
            "DELETE FROM workspace_presence WHERE workspace_id = $1 AND user_session = $2",
        )
        .bind(workspace_id)
        .bind(user_session)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    async fn delete_all_seen_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let r = sqlx::query("DELETE FROM workspace_presence WHERE last_seen < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }
}
