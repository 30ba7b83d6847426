//! Slave replication daemon: one worker per (cluster, slave) pair

use clap::Parser;
use snaplog_core::ReplicationConfig;
use snaplog_postgres::{PgConfig, connect_worker};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Snaplog slave CLI arguments
#[derive(Parser, Debug)]
#[command(name = "snaplog-slave")]
#[command(about = "Replicate one cluster from a PostgreSQL master onto this slave", long_about = None)]
struct Args {
    /// Cluster to replicate
    #[arg(long, short = 'c', env = "SNAPLOG_CLUSTER")]
    cluster: i64,

    /// Name of this slave node in logs
    #[arg(long, short = 'n', env = "SNAPLOG_NODE", default_value = "slave")]
    node: String,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "snaplog_core=debug,snaplog_postgres=debug"
    } else {
        "snaplog_core=info,snaplog_postgres=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Connection settings and tuning both come from SNAPLOG_* variables
    let pg = PgConfig::from_env()?;
    let replication = ReplicationConfig::from_env()?;
    info!(
        available_sleep_ms = replication.available_sleep.as_millis() as u64,
        unavailable_sleep_ms = replication.unavailable_sleep.as_millis() as u64,
        fetch_size = replication.fetch_size,
        "Loaded replication config"
    );

    let worker = connect_worker(&pg, replication, args.cluster, args.node).await?;
    let (handle, task) = worker.spawn();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.shutdown();

    let stats = task.await?;
    info!(
        snapshots_applied = stats.snapshots_applied,
        changes_applied = stats.changes_applied,
        apply_failures = stats.apply_failures,
        "Replication stopped"
    );
    Ok(())
}
