//! Room session service: HTTP surface plus the scheduled ghost reaper.
//!
//! Run with: cargo run -p sessiond -- --config sessiond.toml
//!
//! Settings come from the optional TOML file and `ROOM_SESSIONS_*` variables.
//! Set `database_url = "memory"` for a throwaway in-process store.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use room_sessions_core::{SessionStore, Settings, SystemClock};
use room_sessions_lifecycle::{
    RetryPolicy, SessionManager, spawn_reaper,
    storage::{MemoryStore, SqliteStore},
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MEMORY_DATABASE: &str = "memory";

#[derive(Parser)]
#[command(name = "sessiond")]
#[command(about = "Room session lifecycle service")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `bind_addr`
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    let addr = match args.bind {
        Some(addr) => addr,
        None => settings
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind_addr {}", settings.bind_addr))?,
    };

    if settings.database_url == MEMORY_DATABASE {
        tracing::warn!("Using in-memory session store, sessions are lost on restart");
        serve(MemoryStore::new(), &settings, addr).await
    } else {
        let store = SqliteStore::connect(&settings.database_url)
            .await
            .with_context(|| format!("opening {}", settings.database_url))?;
        serve(store, &settings, addr).await
    }
}

async fn serve<S>(store: S, settings: &Settings, addr: SocketAddr) -> anyhow::Result<()>
where
    S: SessionStore + 'static,
{
    let policy = settings.policy()?;
    let manager = Arc::new(SessionManager::with_clock(
        store,
        policy,
        Arc::new(SystemClock),
        RetryPolicy::from_settings(settings),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = spawn_reaper(Arc::clone(&manager), shutdown_rx);

    let app = room_sessions_transport::http::router(manager);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(
        heartbeat_interval_secs = policy.heartbeat_interval().as_secs(),
        kill_threshold_secs = policy.kill_threshold().as_secs(),
        reaper_interval_secs = policy.reaper_interval().as_secs(),
        "Session service listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
        })
        .await?;

    shutdown_tx.send(true).ok();
    reaper.await?;
    Ok(())
}
