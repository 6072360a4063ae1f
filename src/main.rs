//! Entry point: load config, pick storage backends, and run the server.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workspace_presence::config::{Config, FeedBackend, StoreBackend};
use workspace_presence::db::{self, PgPresenceStore};
use workspace_presence::repositories::{
    ChangeFeed, LocalChangeFeed, MemoryPresenceStore, PresenceStore, RedisChangeFeed,
};
use workspace_presence::services::{IntervalTimer, TabRegistry};
use workspace_presence::{create_app, AppError, AppState, PresenceClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(AppError::from)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn PresenceStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database_url).await?;
            Arc::new(PgPresenceStore::new(pool))
        }
        StoreBackend::Memory => Arc::new(MemoryPresenceStore::new()),
    };
    let feed: Arc<dyn ChangeFeed> = match config.feed_backend {
        FeedBackend::Redis => Arc::new(RedisChangeFeed::new(&config.redis_url)?),
        FeedBackend::Local => Arc::new(LocalChangeFeed::new()),
    };
    tracing::info!(store = ?config.store_backend, feed = ?config.feed_backend, "backends selected");

    let presence = PresenceClient::new(store, feed, &config.activity);
    if let Err(e) = presence.check_schema().await {
        tracing::warn!(error = %e, "presence schema not ready; views will report it until fixed");
    }

    // Global cleanup of rows no sweep will reach, e.g. workspaces nobody reopened.
    presence.purge_older_than(config.purge_after).await;
    let purge_client = presence.clone();
    let purge_after = config.purge_after;
    let _purge = IntervalTimer::spawn(config.purge_interval, move || {
        let client = purge_client.clone();
        async move { client.purge_older_than(purge_after).await }
    });

    let tabs = TabRegistry::with_grace(config.tab_grace);
    let app = create_app(AppState::new(presence, config.activity, tabs));

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
