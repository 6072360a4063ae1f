//! Business logic: tab identity, presence calls, scheduling, and the per-view coordinator.

pub mod activity;
pub mod presence;
pub mod scheduler;
pub mod session;

pub use activity::{Visibility, WorkspaceActivity};
pub use presence::{PresenceClient, Subscription};
pub use scheduler::{DebounceTrigger, Debouncer, IntervalTimer};
pub use session::{MemoryTabStorage, SessionStore, TabLease, TabRegistry, TabStorage};
