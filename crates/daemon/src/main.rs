//! VirtDir daemon entry point.
//!
//! Loads the server configuration, composes the engine from its
//! collaborators, starts every enabled partition, and then waits for
//! signals: SIGHUP reloads the partitions, SIGTERM/SIGINT shuts down
//! gracefully.

mod signals;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use virtdir_core::acl::{AccessControl, AllowAll, ReadOnlySubtrees};
use virtdir_core::config::ServerConfig;
use virtdir_core::interpreter::InterpreterRegistry;
use virtdir_core::pool::WorkerPool;
use virtdir_core::source::AdapterRegistry;
use virtdir_core::{Engine, PartitionManager};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// VirtDir virtual directory daemon.
#[derive(Parser, Debug)]
#[command(
    name = "virtdir-daemon",
    version,
    about = "Virtual directory server mapping one namespace onto heterogeneous backends"
)]
struct Args {
    /// Path to the TOML server configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Build the engine and its collaborators from the configuration. This is
/// the one place components are wired together.
fn compose(config: &ServerConfig) -> (Arc<PartitionManager>, Arc<Engine>) {
    let registry = AdapterRegistry::with_defaults();
    let manager = Arc::new(
        PartitionManager::new(registry, &config.cache.routing).with_lock_wait(
            std::time::Duration::from_secs(config.daemon.lock_wait_secs),
        ),
    );

    let acl: Arc<dyn AccessControl> = if config.read_only_subtrees.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(ReadOnlySubtrees::new(config.read_only_subtrees.clone()))
    };

    let engine = Arc::new(Engine::new(
        manager.clone(),
        Arc::new(InterpreterRegistry::with_defaults()),
        acl,
        WorkerPool::new(config.daemon.worker_threads),
        &config.cache,
    ));

    (manager, engine)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        ServerConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config.validate().context("configuration validation failed")?;

    // Initialize tracing
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  VirtDir Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file    : {}", args.config.display());
    info!("Partitions dir : {}", config.daemon.partitions_dir.display());
    info!("Worker permits : {}", config.daemon.worker_threads);
    info!("Lock wait      : {}s", config.daemon.lock_wait_secs);
    info!("Log level      : {}", log_level);
    info!("========================================");

    let (manager, _engine) = compose(&config);

    manager
        .load_partitions(&config.daemon.partitions_dir)
        .context("failed to read partitions directory")?;
    manager.start_all();

    let started = manager
        .partition_names()
        .into_iter()
        .filter(|name| {
            manager
                .status(name)
                .map(|s| s == virtdir_core::PartitionStatus::Started)
                .unwrap_or(false)
        })
        .count();
    info!(started, total = manager.partition_names().len(), "partitions online");

    // Periodic status logging in the background.
    let status_manager = manager.clone();
    let status_handle = tokio::spawn(async move {
        status::run(status_manager).await;
    });

    // Signal loop: reload on SIGHUP, stop on SIGTERM/SIGINT.
    loop {
        match signals::wait_for_signal().await {
            signals::Signal::Reload => {
                info!("reload requested, restarting partitions");
                manager.stop_all();
                if let Err(e) = manager.load_partitions(&config.daemon.partitions_dir) {
                    warn!(error = %e, "partition reload failed, keeping previous state");
                }
                manager.start_all();
            }
            signals::Signal::Shutdown => break,
        }
    }

    info!("shutdown signal received, stopping partitions");
    status_handle.abort();
    manager.stop_all();
    info!("VirtDir daemon stopped.");
    Ok(())
}
