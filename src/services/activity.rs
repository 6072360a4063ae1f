//! Workspace activity: one stateful presence session per workspace view.
//!
//! Lifecycle: `Initializing` until the schema check passes, then `Active`
//! (heartbeat ticking, change feed subscribed), `Backgrounded` while the tab
//! is hidden (heartbeat paused, sweep still running), and finally
//! `Terminated`, which every exit path (unload, page hide, disconnect, exit
//! button, drop) funnels into exactly once.
//!
//! Timer and subscription tasks hold only a weak reference to the view and
//! read its fields when they fire, so a rename is picked up by the next tick
//! and nothing keeps a torn-down view alive.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ActivityConfig;
use crate::error::{AppError, AppResult};
use crate::models::{ActivitySnapshot, ActivityState, HeartbeatOutcome, OnlineUser, Session};
use crate::services::presence::{PresenceClient, Subscription};
use crate::services::scheduler::{Debouncer, IntervalTimer};
use crate::services::session::SessionStore;

/// Page visibility as reported by the tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Timers and subscription owned by one view; released together.
#[derive(Default)]
struct Resources {
    heartbeat: Option<IntervalTimer>,
    sweep: Option<IntervalTimer>,
    refresh: Option<Debouncer>,
    subscription: Option<Subscription>,
}

impl Resources {
    fn release(&mut self) {
        if let Some(timer) = self.heartbeat.take() {
            timer.cancel();
        }
        if let Some(timer) = self.sweep.take() {
            timer.cancel();
        }
        if let Some(debouncer) = self.refresh.take() {
            debouncer.cancel();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

struct Inner {
    session: Session,
    sessions: SessionStore,
    client: PresenceClient,
    config: ActivityConfig,
    display_name: RwLock<String>,
    state: RwLock<ActivityState>,
    online_users: RwLock<Vec<OnlineUser>>,
    is_online: AtomicBool,
    resources: Mutex<Resources>,
    snapshot_tx: watch::Sender<ActivitySnapshot>,
}

impl Inner {
    fn state(&self) -> ActivityState {
        *self.state.read()
    }

    fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            state: self.state(),
            session_id: self.session.session_id.clone(),
            display_name: self.display_name.read().clone(),
            online_users: self.online_users.read().clone(),
            is_online: self.is_online.load(Ordering::SeqCst),
        }
    }

    fn publish_snapshot(&self) {
        let next = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn send_heartbeat(&self) -> HeartbeatOutcome {
        let name = self.display_name.read().clone();
        let outcome = self
            .client
            .heartbeat(&self.session.workspace_id, &self.session.session_id, &name)
            .await;
        if self.state() != ActivityState::Terminated {
            self.is_online.store(outcome.ok, Ordering::SeqCst);
            self.publish_snapshot();
        }
        outcome
    }

    async fn refresh(&self) {
        let users = self.client.list_online(&self.session.workspace_id).await;
        // A list resolving after teardown is discarded.
        if self.state() == ActivityState::Terminated {
            return;
        }
        debug!(workspace_id = %self.session.workspace_id, count = users.len(), "online users refreshed");
        *self.online_users.write() = users;
        self.publish_snapshot();
    }

    fn heartbeat_timer(self: &Arc<Self>) -> IntervalTimer {
        let weak = Arc::downgrade(self);
        IntervalTimer::spawn(self.config.heartbeat_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    if inner.state() == ActivityState::Active {
                        inner.send_heartbeat().await;
                    }
                }
            }
        })
    }

    fn sweep_timer(self: &Arc<Self>) -> IntervalTimer {
        let weak = Arc::downgrade(self);
        IntervalTimer::spawn(self.config.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.client.sweep_stale(&inner.session.workspace_id).await;
                }
            }
        })
    }

    fn refresh_debouncer(self: &Arc<Self>) -> Debouncer {
        let weak: Weak<Self> = Arc::downgrade(self);
        Debouncer::spawn(
            self.config.refresh_debounce,
            self.config.min_refresh_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.refresh().await;
                    }
                }
            },
        )
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let previous = std::mem::replace(self.state.get_mut(), ActivityState::Terminated);
        self.resources.get_mut().release();
        if !matches!(previous, ActivityState::Active | ActivityState::Backgrounded) {
            return;
        }
        // Dropped without terminate(): remove the row fire-and-forget.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let workspace_id = self.session.workspace_id.clone();
                let session_id = self.session.session_id.clone();
                handle.spawn(async move {
                    client.remove(&workspace_id, &session_id).await;
                });
            }
            Err(_) => {
                warn!(workspace_id = %self.session.workspace_id, "no runtime to remove presence; row will expire");
            }
        }
    }
}

/// Presence session of one tab in one workspace.
pub struct WorkspaceActivity {
    inner: Arc<Inner>,
}

impl WorkspaceActivity {
    /// Resolve this tab's identity for the workspace. Nothing touches the store until [`start`](Self::start).
    pub fn new(
        workspace_id: impl Into<String>,
        sessions: SessionStore,
        client: PresenceClient,
        config: ActivityConfig,
    ) -> Self {
        let workspace_id = workspace_id.into();
        let session_id = sessions.get_or_create_session(&workspace_id);
        let display_name = sessions.get_or_create_display_name(&workspace_id);
        let (snapshot_tx, _rx) = watch::channel(ActivitySnapshot {
            state: ActivityState::Initializing,
            session_id: session_id.clone(),
            display_name: display_name.clone(),
            online_users: Vec::new(),
            is_online: false,
        });
        Self {
            inner: Arc::new(Inner {
                session: Session {
                    workspace_id,
                    session_id,
                },
                sessions,
                client,
                config,
                display_name: RwLock::new(display_name),
                state: RwLock::new(ActivityState::Initializing),
                online_users: RwLock::new(Vec::new()),
                is_online: AtomicBool::new(false),
                resources: Mutex::new(Resources::default()),
                snapshot_tx,
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn display_name(&self) -> String {
        self.inner.display_name.read().clone()
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.inner.online_users.read().clone()
    }

    /// True when the most recent heartbeat succeeded.
    pub fn is_online(&self) -> bool {
        self.inner.is_online.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ActivityState {
        self.inner.state()
    }

    /// Receiver that yields a snapshot whenever anything the page shows changes.
    pub fn watch(&self) -> watch::Receiver<ActivitySnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Confirm the schema, then go `Active`: heartbeat now, schedule a
    /// refresh, start both timers and subscribe to changes.
    ///
    /// A failed readiness check is returned as [`AppError::SchemaNotReady`]
    /// and leaves the view `Initializing`; it is not retried.
    pub async fn start(&self) -> AppResult<()> {
        match self.state() {
            ActivityState::Initializing => {}
            ActivityState::Terminated => {
                return Err(AppError::Validation(
                    "workspace activity already terminated".to_string(),
                ))
            }
            ActivityState::Active | ActivityState::Backgrounded => return Ok(()),
        }

        let inner = &self.inner;
        let workspace_id = inner.session.workspace_id.as_str();
        if let Err(e) = inner.client.check_schema().await {
            warn!(workspace_id = %workspace_id, error = %e, "workspace schema not ready");
            return Err(match e {
                AppError::SchemaNotReady(msg) => AppError::SchemaNotReady(msg),
                other => AppError::SchemaNotReady(other.to_string()),
            });
        }

        {
            let mut state = inner.state.write();
            if *state != ActivityState::Initializing {
                return Ok(());
            }
            *state = ActivityState::Active;
        }
        info!(workspace_id = %workspace_id, session_id = %inner.session.session_id, "workspace activity started");
        inner.publish_snapshot();

        inner.send_heartbeat().await;

        let refresh = inner.refresh_debouncer();
        refresh.fire();
        let trigger = refresh.trigger();
        let subscription = inner
            .client
            .subscribe_to_changes(workspace_id, move |_change| trigger.fire())
            .await;

        let mut resources = inner.resources.lock();
        match inner.state() {
            ActivityState::Terminated => {
                // Torn down while starting; let everything built here drop.
                drop(resources);
                subscription.unsubscribe();
                refresh.cancel();
            }
            state => {
                // A hide and show while starting may already have installed one.
                if state == ActivityState::Active && resources.heartbeat.is_none() {
                    resources.heartbeat = Some(inner.heartbeat_timer());
                }
                resources.sweep = Some(inner.sweep_timer());
                resources.refresh = Some(refresh);
                resources.subscription = Some(subscription);
            }
        }
        Ok(())
    }

    /// Pause the heartbeat while hidden (with one last beat), resume it when visible.
    pub async fn set_visibility(&self, visibility: Visibility) {
        let inner = &self.inner;
        match visibility {
            Visibility::Hidden => {
                {
                    let mut state = inner.state.write();
                    if *state != ActivityState::Active {
                        return;
                    }
                    *state = ActivityState::Backgrounded;
                }
                if let Some(timer) = inner.resources.lock().heartbeat.take() {
                    timer.cancel();
                }
                debug!(workspace_id = %inner.session.workspace_id, "backgrounded");
                inner.send_heartbeat().await;
            }
            Visibility::Visible => {
                {
                    let mut state = inner.state.write();
                    if *state != ActivityState::Backgrounded {
                        return;
                    }
                    *state = ActivityState::Active;
                }
                debug!(workspace_id = %inner.session.workspace_id, "foregrounded");
                inner.send_heartbeat().await;
                let mut resources = inner.resources.lock();
                // Hidden again while the beat was in flight: stay paused.
                if inner.state() == ActivityState::Active && resources.heartbeat.is_none() {
                    resources.heartbeat = Some(inner.heartbeat_timer());
                }
            }
        }
    }

    /// Persist a new name, heartbeat with it, and on success refresh the list
    /// right away instead of waiting for the debouncer.
    pub async fn update_display_name(&self, name: &str) {
        let inner = &self.inner;
        *inner.display_name.write() = name.to_string();
        inner.sessions.set_display_name(&inner.session.workspace_id, name);
        inner.publish_snapshot();

        if !matches!(
            inner.state(),
            ActivityState::Active | ActivityState::Backgrounded
        ) {
            return;
        }
        let outcome = inner.send_heartbeat().await;
        if outcome.ok {
            info!(workspace_id = %inner.session.workspace_id, name = %name, "display name updated");
            inner.refresh().await;
        }
    }

    /// Tear down: stop every timer, close the subscription, go offline and
    /// delete this session's row. Safe to call from several exit paths.
    pub async fn terminate(&self) {
        let inner = &self.inner;
        let previous = std::mem::replace(&mut *inner.state.write(), ActivityState::Terminated);
        if previous == ActivityState::Terminated {
            return;
        }
        inner.resources.lock().release();
        inner.is_online.store(false, Ordering::SeqCst);
        inner.publish_snapshot();

        if matches!(previous, ActivityState::Active | ActivityState::Backgrounded) {
            inner
                .client
                .remove(&inner.session.workspace_id, &inner.session.session_id)
                .await;
        }
        info!(workspace_id = %inner.session.workspace_id, session_id = %inner.session.session_id, "workspace activity terminated");
    }

    /// Leave the workspace. Once this returns the caller navigates away.
    pub async fn exit_workspace(&self) {
        self.terminate().await;
    }
}
