//! HTTP handlers: health, schema readiness, and the online list.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;

use crate::config::ActivityConfig;
use crate::error::AppError;
use crate::models::OnlineUser;
use crate::services::{PresenceClient, TabRegistry};

/// Shared application state for HTTP and WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub presence: PresenceClient,
    pub tabs: TabRegistry,
    pub activity: ActivityConfig,
}

impl AppState {
    pub fn new(presence: PresenceClient, activity: ActivityConfig, tabs: TabRegistry) -> Self {
        Self {
            presence,
            tabs,
            activity,
        }
    }
}

/// GET /health: liveness check.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "workspace-presence" })),
    )
}

/// GET /api/schema: 503 with remediation text until the presence table exists.
pub async fn schema_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.presence.check_schema().await?;
    Ok(Json(json!({ "ready": true })))
}

/// GET /api/workspaces/:workspace_id/online: sessions heard from within the online window.
pub async fn online_users(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> Json<Vec<OnlineUser>> {
    Json(state.presence.list_online(&workspace_id).await)
}
