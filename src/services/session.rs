//! Tab-scoped identity: session id and display name per workspace.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::session::{generate_display_name, generate_session_id};

/// String key/value storage that lives as long as one tab.
pub trait TabStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// Tab storage kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryTabStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryTabStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TabStorage for MemoryTabStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.write().insert(key.to_string(), value.to_string());
    }
}

/// How long a tab's storage outlives its last connection, so a reload keeps its identity.
pub const DEFAULT_TAB_GRACE: Duration = Duration::from_secs(30);

struct TabEntry {
    storage: Arc<MemoryTabStorage>,
    /// Open connections presenting this tab id.
    live: usize,
    /// Bumped on every release-to-zero; only the matching eviction may remove the entry.
    epoch: u64,
    eviction: Option<JoinHandle<()>>,
}

type Tabs = Arc<Mutex<HashMap<String, TabEntry>>>;

/// Tab storages of connected tabs, keyed by the tab id the page presents.
///
/// A storage lives while any connection holds a [`TabLease`] for it, plus a
/// grace period after the last one closes.
#[derive(Clone)]
pub struct TabRegistry {
    tabs: Tabs,
    grace: Duration,
}

impl Default for TabRegistry {
    fn default() -> Self {
        Self::with_grace(DEFAULT_TAB_GRACE)
    }
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            tabs: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Storage for the tab, created on first use. Cancels a pending eviction.
    pub fn acquire(&self, tab_id: &str) -> TabLease {
        let mut tabs = self.tabs.lock();
        let entry = tabs.entry(tab_id.to_string()).or_insert_with(|| TabEntry {
            storage: Arc::new(MemoryTabStorage::new()),
            live: 0,
            epoch: 0,
            eviction: None,
        });
        entry.live += 1;
        if let Some(pending) = entry.eviction.take() {
            pending.abort();
        }
        TabLease {
            storage: Arc::clone(&entry.storage),
            tab_id: tab_id.to_string(),
            tabs: Arc::downgrade(&self.tabs),
            grace: self.grace,
        }
    }

    pub fn len(&self) -> usize {
        self.tabs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn release_tab(tabs: &Tabs, tab_id: &str, grace: Duration) {
    let mut map = tabs.lock();
    let Some(entry) = map.get_mut(tab_id) else {
        return;
    };
    entry.live = entry.live.saturating_sub(1);
    if entry.live > 0 {
        return;
    }
    entry.epoch += 1;
    let epoch = entry.epoch;
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let weak = Arc::downgrade(tabs);
            let id = tab_id.to_string();
            entry.eviction = Some(handle.spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(tabs) = weak.upgrade() {
                    evict_tab(&tabs, &id, epoch);
                }
            }));
        }
        Err(_) => {
            map.remove(tab_id);
        }
    }
}

fn evict_tab(tabs: &Tabs, tab_id: &str, epoch: u64) {
    let mut map = tabs.lock();
    if map
        .get(tab_id)
        .is_some_and(|e| e.live == 0 && e.epoch == epoch)
    {
        map.remove(tab_id);
        debug!(tab_id = %tab_id, "tab storage evicted");
    }
}

/// A connection's hold on its tab storage. Dropping the last one schedules eviction.
pub struct TabLease {
    storage: Arc<MemoryTabStorage>,
    tab_id: String,
    tabs: Weak<Mutex<HashMap<String, TabEntry>>>,
    grace: Duration,
}

impl TabLease {
    pub fn storage(&self) -> Arc<MemoryTabStorage> {
        Arc::clone(&self.storage)
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }
}

impl Drop for TabLease {
    fn drop(&mut self) {
        if let Some(tabs) = self.tabs.upgrade() {
            release_tab(&tabs, &self.tab_id, self.grace);
        }
    }
}

fn session_key(workspace_id: &str) -> String {
    format!("workspace-session-{}", workspace_id)
}

fn name_key(workspace_id: &str) -> String {
    format!("workspace-name-{}", workspace_id)
}

/// Derives and persists a tab's identity for each workspace it opens.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn TabStorage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn TabStorage>) -> Self {
        Self { storage }
    }

    /// Stored session id for the workspace, generating one on first use.
    pub fn get_or_create_session(&self, workspace_id: &str) -> String {
        let key = session_key(workspace_id);
        if let Some(existing) = self.storage.get(&key) {
            return existing;
        }
        let session = generate_session_id();
        self.storage.set(&key, &session);
        session
    }

    /// Stored display name for the workspace, defaulting to `User-xxxx`.
    pub fn get_or_create_display_name(&self, workspace_id: &str) -> String {
        let key = name_key(workspace_id);
        if let Some(existing) = self.storage.get(&key) {
            return existing;
        }
        let name = generate_display_name();
        self.storage.set(&key, &name);
        name
    }

    pub fn set_display_name(&self, workspace_id: &str, name: &str) {
        self.storage.set(&name_key(workspace_id), name);
    }
}
