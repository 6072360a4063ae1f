//! WebSocket handler: one workspace view per socket, fed by page lifecycle messages.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::models::{generate_tab_id, ClientMessage, DisplayNamePayload, WsEvent};
use crate::services::{SessionStore, Visibility, WorkspaceActivity};

/// How long queued events may take to drain after the view is gone.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Tab identity kept by the page across reloads; a fresh tab is assumed when absent.
    pub tab: Option<String>,
}

/// Upgrade to WebSocket for `/ws/workspaces/:workspace_id`.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let tab_id = params
        .tab
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(generate_tab_id);
    ws.on_upgrade(move |socket| handle_socket(state, socket, workspace_id, tab_id))
}

/// Serialized `{"event", "data"}` frame, or `None` (logged) if `data` cannot be encoded.
fn event_text<T: Serialize>(event: &'static str, data: T) -> Option<String> {
    match serde_json::to_string(&WsEvent { event, data }) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(event, error = %e, "dropping unserializable ws event");
            None
        }
    }
}

fn send_event<T: Serialize>(tx: &UnboundedSender<String>, event: &'static str, data: T) {
    if let Some(text) = event_text(event, data) {
        let _ = tx.send(text);
    }
}

fn visibility(hidden: bool) -> Visibility {
    if hidden {
        Visibility::Hidden
    } else {
        Visibility::Visible
    }
}

/// Trim, then enforce the length rule on what would be stored.
fn normalized_name(payload: DisplayNamePayload) -> Result<String, AppError> {
    let trimmed = DisplayNamePayload {
        name: payload.name.trim().to_string(),
    };
    trimmed
        .validate()
        .map_err(|_| AppError::Validation("name must be 1 to 64 characters".to_string()))?;
    Ok(trimmed.name)
}

/// Apply one page message to the view. `Break` means the page left and the socket should close.
async fn handle_text(
    activity: &WorkspaceActivity,
    text: &str,
    tx: &UnboundedSender<String>,
) -> ControlFlow<()> {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(session_id = %activity.session().session_id, error = %e, "unreadable ws message");
            send_event(tx, "error", json!({ "message": "invalid message" }));
            return ControlFlow::Continue(());
        }
    };
    match client_msg {
        ClientMessage::Visibility { data } => {
            activity.set_visibility(visibility(data.hidden)).await;
        }
        ClientMessage::SetDisplayName { data } => match normalized_name(data) {
            Ok(name) => activity.update_display_name(&name).await,
            Err(e) => send_event(tx, "error", json!({ "message": e.to_string() })),
        },
        ClientMessage::PageHide => activity.terminate().await,
        ClientMessage::Exit => {
            activity.exit_workspace().await;
            send_event(tx, "exited", json!({}));
            return ControlFlow::Break(());
        }
        ClientMessage::Ping => send_event(tx, "pong", json!({})),
    }
    ControlFlow::Continue(())
}

/// Start the view, feed it page messages until the page closes or leaves, then terminate it.
async fn drive_view<S, E>(activity: &WorkspaceActivity, mut incoming: S, tx: &UnboundedSender<String>)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    if let Err(e) = activity.start().await {
        send_event(tx, "schema_not_ready", json!({ "message": e.to_string() }));
    }

    while let Some(next) = incoming.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session_id = %activity.session().session_id, error = %e, "ws read failed");
                break;
            }
        };
        if handle_text(activity, &text, tx).await.is_break() {
            break;
        }
    }

    activity.terminate().await;
}

async fn handle_socket(state: AppState, socket: WebSocket, workspace_id: String, tab_id: String) {
    let tab = state.tabs.acquire(&tab_id);
    let activity = WorkspaceActivity::new(
        workspace_id.clone(),
        SessionStore::new(tab.storage()),
        state.presence.clone(),
        state.activity,
    );
    let session_id = activity.session().session_id.clone();
    info!(workspace_id = %workspace_id, tab_id = %tab_id, session_id = %session_id, "ws connected");

    let (mut sender, receiver) = socket.split();

    let Some(established) = event_text(
        "connection_established",
        json!({
            "tab_id": tab_id,
            "session_id": session_id,
            "display_name": activity.display_name(),
        }),
    ) else {
        return;
    };
    if sender.send(Message::Text(established)).await.is_err() {
        return;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut snapshots = activity.watch();
    let tx_state = tx.clone();
    let state_task = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            send_event(&tx_state, "presence_state", &snapshot);
            if tx_state.is_closed() {
                break;
            }
        }
    });

    drive_view(&activity, receiver, &tx).await;

    // Dropping the view closes its snapshot channel, which ends the forwarder.
    drop(activity);
    drop(tx);
    let _ = state_task.await;
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        warn!(session_id = %session_id, "ws send queue not drained");
        send_task.abort();
    }
    info!(workspace_id = %workspace_id, session_id = %session_id, "ws disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivityConfig;
    use crate::models::ActivityState;
    use crate::repositories::{LocalChangeFeed, MemoryPresenceStore};
    use crate::services::{MemoryTabStorage, PresenceClient};
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn open_view(store: Arc<MemoryPresenceStore>) -> WorkspaceActivity {
        let client = PresenceClient::new(
            store,
            Arc::new(LocalChangeFeed::new()),
            &ActivityConfig::default(),
        );
        WorkspaceActivity::new(
            "ws",
            SessionStore::new(Arc::new(MemoryTabStorage::new())),
            client,
            ActivityConfig::default(),
        )
    }

    fn text(raw: &str) -> Result<Message, Infallible> {
        Ok(Message::Text(raw.to_string()))
    }

    /// Everything sent so far, as parsed frames.
    fn sent(rx: &mut UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            frames.push(serde_json::from_str(&raw).unwrap());
        }
        frames
    }

    fn names(frames: &[serde_json::Value]) -> Vec<&str> {
        frames.iter().filter_map(|f| f["event"].as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn page_messages_drive_the_view() {
        let store = Arc::new(MemoryPresenceStore::new());
        let view = open_view(store.clone());
        let session_id = view.session().session_id.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (page, incoming) = futures::channel::mpsc::unbounded();

        let view_ref = &view;
        let store_ref = &store;
        let script = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(view_ref.state(), ActivityState::Active);
            assert!(store_ref.contains("ws", &session_id));

            page.unbounded_send(text(r#"{"event":"visibility","data":{"hidden":true}}"#))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(view_ref.state(), ActivityState::Backgrounded);

            page.unbounded_send(text(r#"{"event":"visibility","data":{"hidden":false}}"#))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(view_ref.state(), ActivityState::Active);

            page.unbounded_send(text(r#"{"event":"set_display_name","data":{"name":"  Zed "}}"#))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(view_ref.display_name(), "Zed");

            page.unbounded_send(text(r#"{"event":"set_display_name","data":{"name":"   "}}"#))
                .unwrap();
            page.unbounded_send(text("not json")).unwrap();
            page.unbounded_send(text(r#"{"event":"ping"}"#)).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(view_ref.display_name(), "Zed");
            // Page goes away without a close frame.
        };
        tokio::join!(drive_view(&view, incoming, &tx), script);

        assert_eq!(view.state(), ActivityState::Terminated);
        assert!(store.is_empty(), "closing the socket removes the row");
        let frames = sent(&mut rx);
        assert_eq!(names(&frames), vec!["error", "error", "pong"]);
        assert!(frames[0]["data"]["message"]
            .as_str()
            .unwrap()
            .contains("1 to 64"));
    }

    #[tokio::test]
    async fn exit_replies_exited_and_stops_reading() {
        let store = Arc::new(MemoryPresenceStore::new());
        let view = open_view(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let incoming = futures::stream::iter(vec![text(r#"{"event":"exit"}"#), text(r#"{"event":"ping"}"#)]);

        drive_view(&view, incoming, &tx).await;

        assert_eq!(view.state(), ActivityState::Terminated);
        assert!(store.is_empty());
        assert_eq!(names(&sent(&mut rx)), vec!["exited"]);
    }

    #[tokio::test]
    async fn close_frame_terminates_view() {
        let store = Arc::new(MemoryPresenceStore::new());
        let view = open_view(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let incoming = futures::stream::iter(vec![
            text(r#"{"event":"ping"}"#),
            Ok(Message::Close(None)),
            text(r#"{"event":"visibility","data":{"hidden":true}}"#),
        ]);

        drive_view(&view, incoming, &tx).await;

        assert_eq!(view.state(), ActivityState::Terminated);
        assert!(store.is_empty());
        assert_eq!(names(&sent(&mut rx)), vec!["pong"]);
    }

    #[tokio::test]
    async fn page_hide_terminates_but_keeps_socket() {
        let store = Arc::new(MemoryPresenceStore::new());
        let view = open_view(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (page, incoming) = futures::channel::mpsc::unbounded();
        page.unbounded_send(text(r#"{"event":"page_hide"}"#)).unwrap();
        page.unbounded_send(text(r#"{"event":"ping"}"#)).unwrap();

        let view_ref = &view;
        let store_ref = &store;
        let script = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(view_ref.state(), ActivityState::Terminated);
            assert!(store_ref.is_empty());
            drop(page);
        };
        tokio::join!(drive_view(&view, incoming, &tx), script);

        assert_eq!(names(&sent(&mut rx)), vec!["pong"]);
    }

    #[tokio::test]
    async fn missing_schema_is_reported_to_page() {
        let store = Arc::new(MemoryPresenceStore::new());
        store.set_schema_ready(false);
        let view = open_view(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        drive_view(&view, futures::stream::iter(Vec::<Result<Message, Infallible>>::new()), &tx).await;

        let frames = sent(&mut rx);
        assert_eq!(names(&frames), vec!["schema_not_ready"]);
        assert!(frames[0]["data"]["message"]
            .as_str()
            .unwrap()
            .contains("workspace_presence.sql"));
        assert!(store.is_empty());
    }

    #[test]
    fn events_are_tagged_with_name_and_data() {
        let raw = event_text("pong", json!({})).unwrap();
        assert_eq!(raw, r#"{"event":"pong","data":{}}"#);
    }

    #[test]
    fn unserializable_event_is_skipped() {
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        assert!(event_text("presence_state", &bad).is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        send_event(&tx, "presence_state", &bad);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hidden_flag_maps_to_visibility() {
        assert_eq!(visibility(true), Visibility::Hidden);
        assert_eq!(visibility(false), Visibility::Visible);
    }

    #[test]
    fn names_are_trimmed_before_validation() {
        let name = normalized_name(DisplayNamePayload {
            name: "  Alice ".to_string(),
        })
        .unwrap();
        assert_eq!(name, "Alice");

        assert!(normalized_name(DisplayNamePayload {
            name: "   ".to_string()
        })
        .is_err());
        assert!(normalized_name(DisplayNamePayload {
            name: "x".repeat(65)
        })
        .is_err());
    }
}
