//! Change notifications and WebSocket messages.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::presence::OnlineUser;

/// Kind of presence row change. Consumers re-list on any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change to some presence row of a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub workspace_id: String,
    pub kind: ChangeKind,
}

impl PresenceChange {
    pub fn new(workspace_id: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            kind,
        }
    }
}

/// Lifecycle of one workspace view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Schema readiness not confirmed yet.
    Initializing,
    /// Heartbeat running, subscription live.
    Active,
    /// Tab hidden: heartbeat paused, sweep still running.
    Backgrounded,
    /// Torn down; nothing runs any more.
    Terminated,
}

/// Everything the page needs to render presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySnapshot {
    pub state: ActivityState,
    pub session_id: String,
    pub display_name: String,
    pub online_users: Vec<OnlineUser>,
    pub is_online: bool,
}

/// Event sent over WebSocket to the page.
#[derive(Debug, Clone, Serialize)]
pub struct WsEvent<T: Serialize> {
    pub event: &'static str,
    pub data: T,
}

/// WebSocket page message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    Visibility { data: VisibilityPayload },
    SetDisplayName { data: DisplayNamePayload },
    PageHide,
    Exit,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityPayload {
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DisplayNamePayload {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
}
