use std::sync::Arc;

use anyhow::Context;
use scrumflow_relay::{
    build_router,
    config::{LogFormat, RelayConfig},
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    realtime::row_changes::spawn_row_change_listener,
    session::CollaborationStore,
    shutdown_signal, AppState,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let pool = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to create relay database pool")?;
            check_pool_health(&pool).await.context("relay database is not reachable")?;
            run_migrations(&pool).await.context("failed to apply relay migrations")?;
            Some(pool)
        }
        None => {
            warn!("SCRUMFLOW_RELAY_DATABASE_URL not set; using in-memory collaboration store");
            None
        }
    };

    let store = match &pool {
        Some(pool) => CollaborationStore::Postgres(pool.clone()),
        None => CollaborationStore::memory(),
    };
    let state = AppState::new(store, config.presence_window);
    if let Some(pool) = pool {
        spawn_row_change_listener(pool, state.hub.clone(), Arc::clone(&state.metrics));
    }

    let app = build_router(state, config.cors_origins.as_deref());
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
