//! WAL Listener Core entry point: loads configuration, wires the
//! control-plane and archive stores, and runs the Supervisor's
//! reconcile loop until terminated.

mod assembler;
mod config;
mod errors;
mod store;
mod supervisor;
mod tracing_context;
mod wire;
mod worker;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use config::AppConfig;
use errors::CoreResult;
use store::{PgArchiveStore, PgControlPlaneStore};
use supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "wal-listener-core", about = "Postgres logical replication CDC core", version)]
struct Args {
    /// Run one reconciliation pass and exit, instead of looping forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> CoreResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    let control_plane = Arc::new(PgControlPlaneStore::new(&config.control_store));
    let archive_store = Arc::new(PgArchiveStore::new(&config.archive_store));

    let supervisor = Supervisor::new(
        control_plane,
        archive_store,
        config.feedback_interval,
        config.reconnect_backoff,
        config.read_timeout,
    );

    if args.once {
        supervisor.reconcile().await;
        return Ok(());
    }

    supervisor.run(config.check_interval).await;
    Ok(())
}
