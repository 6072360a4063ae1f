//! Routes: JSON endpoints and the workspace WebSocket.

pub mod http;
pub mod ws;

pub use http::{health, online_users, schema_status, AppState};
pub use ws::{ws_handler, WsParams};
