//! Application error types for robust error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// SQLSTATE for `undefined_table`.
const PG_UNDEFINED_TABLE: &str = "42P01";

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The presence relation is missing; the view cannot start until an operator runs the setup SQL.
    #[error("{0}")]
    SchemaNotReady(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Map a failed schema check: a missing table becomes `SchemaNotReady` with remediation text.
    pub fn from_schema_check(err: sqlx::Error) -> Self {
        let undefined_table = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == PG_UNDEFINED_TABLE);
        if undefined_table {
            AppError::SchemaNotReady(
                "Database tables not found. Please run sql/workspace_presence.sql".to_string(),
            )
        } else {
            AppError::Db(err)
        }
    }
}

impl From<crate::config::ConfigLoadError> for AppError {
    fn from(err: crate::config::ConfigLoadError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::SchemaNotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Redis(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Redis error: {}", e),
            ),
            AppError::Db(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Database error: {}", e),
            ),
            AppError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid payload: {}", e),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            ),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
