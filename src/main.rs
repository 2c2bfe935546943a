//! tunewatch daemon
//!
//! Loads environment configuration, initializes the store, and runs one
//! worker per enabled RTSP stream until interrupted. SIGHUP re-reads the
//! environment and hot-reloads the stream set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunewatch::clock::SystemClock;
use tunewatch::config::Config;
use tunewatch::db::{init_database, Store};
use tunewatch::pipeline::WorkerManager;

/// Interval between periodic worker status log lines.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// tunewatch - music recognition and play logging for RTSP streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database path (overrides DB_PATH)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunewatch={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("tunewatch starting...");

    // Configuration errors fail fast with a nonzero exit.
    let mut config = Config::from_env()?;
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.display().to_string();
    }
    if config.enabled_streams().count() == 0 {
        error!("no enabled streams configured");
        anyhow::bail!("no enabled streams configured");
    }

    info!("initializing database at {}", config.db_path);
    let pool = init_database(config.db_path.as_ref()).await?;
    let store = Store::new(pool, config.dedup_seconds);

    let mut manager = WorkerManager::new(config, store, Arc::new(SystemClock));
    manager.start_all().await?;

    let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);
    status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    status_ticker.tick().await; // first tick fires immediately

    #[cfg(unix)]
    let mut sighup =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sighup.recv() => {
                    match Config::from_env() {
                        Ok(new_config) => {
                            if let Err(e) = manager.reload(new_config).await {
                                error!("configuration reload failed: {e}");
                            }
                        }
                        Err(e) => error!("ignoring invalid configuration on reload: {e}"),
                    }
                }
                _ = status_ticker.tick() => manager.log_status(),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = status_ticker.tick() => manager.log_status(),
            }
        }
    }

    info!("shutdown signal received");
    manager.shutdown().await;
    info!("tunewatch stopped");
    Ok(())
}
