// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use useragent_pool::{bootstrap, load_config, PoolHandles, SystemClock};

/// Background maintenance for the user-agent pool: cooldown recovery,
/// suspension recovery and leak reporting.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "POOL_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Seconds between maintenance sweeps.
    #[arg(long, env = "POOL_SWEEP_INTERVAL", default_value_t = 30)]
    interval_seconds: u64,

    /// Report members whose session expires within this many minutes.
    #[arg(long, default_value_t = 10)]
    session_buffer_minutes: i64,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> useragent_pool::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(&cli.config)?;
    let handles = bootstrap(&config, Arc::new(SystemClock)).await?;
    info!(
        interval_seconds = cli.interval_seconds,
        "Pool housekeeper started"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.interval_seconds));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweep(&handles, cli.session_buffer_minutes).await {
                    error!(error = %e, "Maintenance sweep failed");
                }
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received; stopping housekeeper");
                break;
            }
        }
    }
    Ok(())
}

async fn sweep(handles: &PoolHandles, session_buffer_minutes: i64) -> useragent_pool::Result<()> {
    handles.pool.recover_cooldowns().await?;

    for id in handles.pool.recoverable_ids().await? {
        handles.pool.restore_to_pool(id).await?;
    }

    let leaked = handles.pool.detect_leaked().await?;
    let expiring = handles
        .pool
        .session_expiring_ids(session_buffer_minutes * 60_000)
        .await?;
    if !expiring.is_empty() {
        info!(ids = ?expiring, "Sessions expiring soon; renewal recommended");
    }

    let stats = handles.pool.pool_stats().await?;
    info!(
        total = stats.total,
        idle = stats.idle,
        borrowed = stats.borrowed,
        cooldown = stats.cooldown,
        session_required = stats.session_required,
        suspended = stats.suspended,
        leaked = leaked.len(),
        health_avg = stats.health_avg,
        "Pool sweep complete"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,useragent_pool=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
