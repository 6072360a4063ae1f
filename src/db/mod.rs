//! Database layer: pool and the PostgreSQL presence store.

mod pool;
mod repositories;

pub use pool::{create_pool, DbPool};
pub use repositories::PgPresenceStore;
