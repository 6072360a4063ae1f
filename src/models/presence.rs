//! Presence rows: one per session viewing a workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Projection of a presence row shown to the page. Field names follow the
/// `workspace_presence` columns so JSON matches what page scripts already read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_session: String,
    pub user_name: String,
}

impl OnlineUser {
    pub fn new(user_session: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_session: user_session.into(),
            user_name: user_name.into(),
        }
    }
}

/// Heartbeat write: upserted on `(workspace_id, user_session)`.
#[derive(Debug, Clone)]
pub struct PresenceUpsert<'a> {
    pub workspace_id: &'a str,
    pub user_session: &'a str,
    pub user_name: &'a str,
    /// Stamped when the heartbeat is issued, not when it completes.
    pub last_seen: DateTime<Utc>,
}

/// Store-level result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Result of a heartbeat as seen by the coordinator; never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HeartbeatOutcome {
    pub fn success() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}
