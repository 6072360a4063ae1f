//! Presence client: heartbeats, staleness-filtered listing, cleanup, change subscription.
//!
//! Every call here is network-fallible and none of them returns a store error.
//! Failures become a [`HeartbeatOutcome`], an empty list, or a log line; the
//! next timer tick is the retry.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ActivityConfig;
use crate::error::AppResult;
use crate::models::{
    ChangeKind, HeartbeatOutcome, OnlineUser, PresenceChange, PresenceUpsert, UpsertOutcome,
};
use crate::repositories::{ChangeFeed, PresenceStore};

/// Presence operations for any workspace, shared by every view in the process.
#[derive(Clone)]
pub struct PresenceClient {
    store: Arc<dyn PresenceStore>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    online_window: Duration,
    stale_window: Duration,
}

impl PresenceClient {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        feed: Arc<dyn ChangeFeed>,
        config: &ActivityConfig,
    ) -> Self {
        Self::with_clock(store, feed, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: Arc<dyn PresenceStore>,
        feed: Arc<dyn ChangeFeed>,
        clock: Arc<dyn Clock>,
        config: &ActivityConfig,
    ) -> Self {
        Self {
            store,
            feed,
            clock,
            online_window: config.online_window,
            stale_window: config.stale_window,
        }
    }

    fn cutoff(&self, age: Duration) -> DateTime<Utc> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Readiness gate for a view. The only call whose error reaches the page.
    pub async fn check_schema(&self) -> AppResult<()> {
        self.store.check_schema().await
    }

    /// Upsert this session's row with `last_seen = now`.
    #[instrument(skip(self, display_name))]
    pub async fn heartbeat(
        &self,
        workspace_id: &str,
        session_id: &str,
        display_name: &str,
    ) -> HeartbeatOutcome {
        let row = PresenceUpsert {
            workspace_id,
            user_session: session_id,
            user_name: display_name,
            last_seen: self.clock.now(),
        };
        match self.store.upsert(row).await {
            Ok(outcome) => {
                let kind = match outcome {
                    UpsertOutcome::Inserted => ChangeKind::Insert,
                    UpsertOutcome::Updated => ChangeKind::Update,
                };
                self.notify(workspace_id, kind).await;
                debug!(workspace_id = %workspace_id, session_id = %short(session_id), "presence updated");
                HeartbeatOutcome::success()
            }
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "presence heartbeat failed");
                HeartbeatOutcome::failure(e.to_string())
            }
        }
    }

    /// Sessions seen within the online window, in creation order. Empty on failure.
    #[instrument(skip(self))]
    pub async fn list_online(&self, workspace_id: &str) -> Vec<OnlineUser> {
        let cutoff = self.cutoff(self.online_window);
        match self.store.list_seen_since(workspace_id, cutoff).await {
            Ok(users) => users,
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "fetching online users failed");
                Vec::new()
            }
        }
    }

    /// Delete rows of the workspace older than the stale window.
    #[instrument(skip(self))]
    pub async fn sweep_stale(&self, workspace_id: &str) {
        let cutoff = self.cutoff(self.stale_window);
        match self.store.delete_seen_before(workspace_id, cutoff).await {
            Ok(0) => {}
            Ok(removed) => {
                info!(workspace_id = %workspace_id, removed, "stale presence swept");
                self.notify(workspace_id, ChangeKind::Delete).await;
            }
            Err(e) => warn!(workspace_id = %workspace_id, error = %e, "stale presence sweep failed"),
        }
    }

    /// Delete this session's own row. Safe to repeat.
    #[instrument(skip(self))]
    pub async fn remove(&self, workspace_id: &str, session_id: &str) {
        match self.store.delete_session(workspace_id, session_id).await {
            Ok(0) => debug!(workspace_id = %workspace_id, "no presence row to remove"),
            Ok(_) => {
                info!(workspace_id = %workspace_id, session_id = %short(session_id), "presence removed");
                self.notify(workspace_id, ChangeKind::Delete).await;
            }
            Err(e) => warn!(workspace_id = %workspace_id, error = %e, "presence removal failed"),
        }
    }

    /// Delete rows of every workspace not seen for `max_age`.
    pub async fn purge_older_than(&self, max_age: Duration) {
        let cutoff = self.cutoff(max_age);
        match self.store.delete_all_seen_before(cutoff).await {
            Ok(removed) => info!(removed, "old presence rows purged"),
            Err(e) => warn!(error = %e, "presence purge failed"),
        }
    }

    /// Call `on_change` for every change to the workspace's rows until unsubscribed.
    pub async fn subscribe_to_changes<F>(&self, workspace_id: &str, on_change: F) -> Subscription
    where
        F: Fn(PresenceChange) + Send + Sync + 'static,
    {
        let rx = match self.feed.subscribe(workspace_id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "change feed unavailable; relying on heartbeat and sweep");
                return Subscription::inert();
            }
        };
        info!(workspace_id = %workspace_id, "change subscription open");

        let workspace = workspace_id.to_string();
        let mut lease = FeedLease {
            rx: Some(rx),
            feed: Arc::clone(&self.feed),
            workspace_id: workspace.clone(),
        };
        let task = tokio::spawn(async move {
            let Some(rx) = lease.rx.as_mut() else {
                return;
            };
            loop {
                match rx.recv().await {
                    Ok(change) => on_change(change),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(workspace_id = %workspace, skipped, "change subscription lagged");
                        on_change(PresenceChange::new(workspace.clone(), ChangeKind::Update));
                    }
                    Err(RecvError::Closed) => {
                        warn!(workspace_id = %workspace, "change subscription dropped");
                        break;
                    }
                }
            }
        });
        Subscription::new(task)
    }

    async fn notify(&self, workspace_id: &str, kind: ChangeKind) {
        let change = PresenceChange::new(workspace_id, kind);
        if let Err(e) = self.feed.publish(&change).await {
            warn!(workspace_id = %workspace_id, error = %e, "publishing presence change failed");
        }
    }
}

/// Receiver owned by a subscription task. Dropping it hands the workspace
/// back to the feed, which closes the topic once nobody else listens.
struct FeedLease {
    rx: Option<broadcast::Receiver<PresenceChange>>,
    feed: Arc<dyn ChangeFeed>,
    workspace_id: String,
}

impl Drop for FeedLease {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.feed.release(&self.workspace_id);
    }
}

fn short(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

/// Handle to a change subscription. Unsubscribing is idempotent and happens on drop.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
    closed: AtomicBool,
}

impl Subscription {
    fn new(task: JoinHandle<()>) -> Self {
        Self {
            task: Some(task),
            closed: AtomicBool::new(false),
        }
    }

    fn inert() -> Self {
        Self {
            task: None,
            closed: AtomicBool::new(true),
        }
    }

    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// False once unsubscribed or once the feed went away.
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::AppError;
    use crate::repositories::{LocalChangeFeed, MemoryPresenceStore, FEED_CAPACITY};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        store: Arc<MemoryPresenceStore>,
        feed: Arc<LocalChangeFeed>,
        clock: Arc<ManualClock>,
        client: PresenceClient,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPresenceStore::new());
        let feed = Arc::new(LocalChangeFeed::new());
        let clock = Arc::new(ManualClock::default());
        let client = PresenceClient::with_clock(
            store.clone(),
            feed.clone(),
            clock.clone(),
            &ActivityConfig::default(),
        );
        Fixture {
            store,
            feed,
            clock,
            client,
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[tokio::test]
    async fn heartbeat_then_list_shows_current_name() {
        let f = fixture();
        assert!(f.client.heartbeat("ws", "a", "Alice").await.ok);
        assert_eq!(f.client.list_online("ws").await, vec![OnlineUser::new("a", "Alice")]);

        assert!(f.client.heartbeat("ws", "a", "Al").await.ok);
        assert_eq!(f.client.list_online("ws").await, vec![OnlineUser::new("a", "Al")]);
    }

    #[tokio::test]
    async fn record_past_online_window_is_hidden_before_sweep() {
        let f = fixture();
        f.client.heartbeat("ws", "a", "Alice").await;
        f.clock.advance(secs(31));
        assert!(f.client.list_online("ws").await.is_empty());
        assert!(f.store.contains("ws", "a"), "listing must not delete");
    }

    #[tokio::test]
    async fn sweep_deletes_only_stale_records() {
        let f = fixture();
        f.client.heartbeat("ws", "old", "Old").await;
        f.clock.advance(secs(60));
        f.client.heartbeat("ws", "recent", "Recent").await;
        f.clock.advance(secs(61));

        f.client.sweep_stale("ws").await;
        assert!(!f.store.contains("ws", "old"));
        assert!(f.store.contains("ws", "recent"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let f = fixture();
        f.client.heartbeat("ws", "a", "Alice").await;
        f.client.remove("ws", "a").await;
        f.client.remove("ws", "a").await;
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn two_sessions_scenario() {
        let f = fixture();
        // t=0: A heartbeats as Alice.
        f.client.heartbeat("ws", "A", "Alice").await;
        // t=1: B sees A.
        f.clock.advance(secs(1));
        assert_eq!(f.client.list_online("ws").await, vec![OnlineUser::new("A", "Alice")]);
        // t=2: A renames.
        f.clock.advance(secs(1));
        f.client.heartbeat("ws", "A", "Al").await;
        f.clock.advance(secs(1));
        assert_eq!(f.client.list_online("ws").await, vec![OnlineUser::new("A", "Al")]);
        // t=35: A went silent after t=2.
        f.clock.set(f.clock.now() + secs(32));
        assert!(f.client.list_online("ws").await.is_empty());
    }

    #[tokio::test]
    async fn writes_publish_changes_for_the_workspace() {
        let f = fixture();
        let mut rx = f.feed.subscribe("ws").await.unwrap();

        f.client.heartbeat("ws", "a", "Alice").await;
        f.client.heartbeat("ws", "a", "Alice").await;
        f.client.remove("ws", "a").await;
        f.client.remove("ws", "a").await;

        let kinds: Vec<ChangeKind> = (0..3).map(|_| rx.try_recv().unwrap().kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
        assert!(rx.try_recv().is_err(), "a no-op removal publishes nothing");
    }

    #[tokio::test]
    async fn subscription_invokes_callback_until_unsubscribed() {
        let f = fixture();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = f
            .client
            .subscribe_to_changes("ws", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(sub.is_active());

        f.client.heartbeat("ws", "a", "Alice").await;
        f.client.heartbeat("other", "b", "Bob").await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        f.client.heartbeat("ws", "a", "Alice").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribing_last_view_releases_feed_topic() {
        let f = fixture();
        let first = f.client.subscribe_to_changes("ws", |_| {}).await;
        let second = f.client.subscribe_to_changes("ws", |_| {}).await;
        assert_eq!(f.feed.topic_count(), 1);

        first.unsubscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.feed.topic_count(), 1);

        drop(second);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.feed.topic_count(), 0);
    }

    #[tokio::test]
    async fn many_workspaces_leave_no_topics_behind() {
        let f = fixture();
        for i in 0..100 {
            let sub = f
                .client
                .subscribe_to_changes(&format!("ws-{i}"), |_| {})
                .await;
            sub.unsubscribe();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.feed.topic_count(), 0);
    }

    #[tokio::test]
    async fn lagged_receiver_still_reports_one_change() {
        let f = fixture();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = f
            .client
            .subscribe_to_changes("ws", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // Publish without yielding so the forwarding task falls behind.
        let overflow = 10;
        for _ in 0..FEED_CAPACITY + overflow {
            f.feed
                .publish(&PresenceChange::new("ws", ChangeKind::Update))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        // One call for the skipped batch, then every retained change.
        assert_eq!(seen.load(Ordering::SeqCst), FEED_CAPACITY + 1);
    }

    #[tokio::test]
    async fn closed_feed_ends_subscription() {
        let f = fixture();
        let sub = f.client.subscribe_to_changes("ws", |_| {}).await;
        f.feed.close("ws");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sub.is_active());
    }

    struct BrokenStore;

    #[async_trait]
    impl PresenceStore for BrokenStore {
        async fn check_schema(&self) -> AppResult<()> {
            Err(AppError::SchemaNotReady("run setup".to_string()))
        }
        async fn upsert(&self, _row: PresenceUpsert<'_>) -> AppResult<UpsertOutcome> {
            Err(AppError::Validation("store offline".to_string()))
        }
        async fn list_seen_since(&self, _: &str, _: DateTime<Utc>) -> AppResult<Vec<OnlineUser>> {
            Err(AppError::Validation("store offline".to_string()))
        }
        async fn delete_seen_before(&self, _: &str, _: DateTime<Utc>) -> AppResult<u64> {
            Err(AppError::Validation("store offline".to_string()))
        }
        async fn delete_session(&self, _: &str, _: &str) -> AppResult<u64> {
            Err(AppError::Validation("store offline".to_string()))
        }
        async fn delete_all_seen_before(&self, _: DateTime<Utc>) -> AppResult<u64> {
            Err(AppError::Validation("store offline".to_string()))
        }
    }

    #[tokio::test]
    async fn store_failures_never_escape() {
        let client = PresenceClient::new(
            Arc::new(BrokenStore),
            Arc::new(LocalChangeFeed::new()),
            &ActivityConfig::default(),
        );
        let outcome = client.heartbeat("ws", "a", "Alice").await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("store offline"));
        assert!(client.list_online("ws").await.is_empty());
        client.sweep_stale("ws").await;
        client.remove("ws", "a").await;
        client.purge_older_than(Duration::from_secs(3600)).await;
        assert!(matches!(
            client.check_schema().await,
            Err(AppError::SchemaNotReady(_))
        ));
    }

    #[tokio::test]
    async fn purge_spans_workspaces() {
        let f = fixture();
        f.client.heartbeat("ws-1", "a", "A").await;
        f.client.heartbeat("ws-2", "b", "B").await;
        f.clock.advance(secs(3601));
        f.client.heartbeat("ws-2", "c", "C").await;
        f.client.purge_older_than(Duration::from_secs(3600)).await;
        assert_eq!(f.store.len(), 1);
        assert!(f.store.contains("ws-2", "c"));
    }
}
