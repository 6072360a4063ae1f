//! Presence tracking for URL-addressed collaborative workspaces.
//!
//! Each tab viewing a workspace holds a session that heartbeats into a shared
//! store, lists who else was seen recently, and re-lists when the store's
//! change feed reports activity. Abandoned sessions expire by time.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::presence::PresenceClient;
pub use services::activity::WorkspaceActivity;

use axum::routing::get;
use handlers::http;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the router (health, schema, online list, ws). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    let api_routes = axum::Router::new()
        .route("/schema", get(http::schema_status))
        .route("/workspaces/:workspace_id/online", get(http::online_users));

    axum::Router::new()
        .route("/ws/workspaces/:workspace_id", get(handlers::ws_handler))
        .route("/health", get(http::health))
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
