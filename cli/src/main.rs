//! chainfollow CLI — follow a Cardano node through Ogmios.
//!
//! Usage:
//! ```bash
//! chainfollow run   ./chainfollow.json
//! chainfollow check ./chainfollow.json
//! chainfollow info
//! ```

mod config;
mod telemetry;

use anyhow::Result;
use serde_json::json;
use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chainfollow_core::{
    BlockMirror, ChainFollower, ChannelPublisher, CheckpointStore, FollowerConfig,
    FollowerMetrics, Hooks, Processor, RetryPolicy,
};
use chainfollow_ogmios::{OgmiosConnector, ServerHealth, DEFAULT_WINDOW};
use chainfollow_storage::{InMemoryStorage, SqliteStorage};

use config::{AppConfig, StorageConfig};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);
const BUS_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => match args.get(2) {
            Some(path) => cmd_run(Path::new(path)).await,
            None => missing_config(),
        },
        "check" => match args.get(2) {
            Some(path) => cmd_check(Path::new(path)),
            None => missing_config(),
        },
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainfollow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn missing_config() -> Result<()> {
    eprintln!("Missing config file argument");
    print_usage();
    process::exit(1);
}

fn print_usage() {
    println!("chainfollow {}", env!("CARGO_PKG_VERSION"));
    println!("Rollback-aware Cardano chain follower\n");
    println!("USAGE:");
    println!("    chainfollow <COMMAND> [CONFIG]\n");
    println!("COMMANDS:");
    println!("    run <config.json>    Follow the chain until Ctrl-C");
    println!("    check <config.json>  Validate a config file and print the effective settings");
    println!("    info                 Show defaults");
    println!("    version              Print version");
    println!("    help                 Print this help");
    println!("\nENVIRONMENT:");
    println!("    OGMIOS_HOST, OGMIOS_PORT  override the ogmios section");
    println!("    RUST_LOG                  override the log section");
}

fn cmd_info() {
    let defaults = FollowerConfig::default();
    println!("chainfollow v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default confirmation depth: {} blocks", defaults.block_to_wait);
    println!("  Default snapshot interval: {} ms", defaults.snapshot_interval_ms);
    println!("  Default watchdog interval: {} ms", defaults.watchdog_interval_ms);
    println!("  Default topic: {}", defaults.topic);
    println!("  Rollback window: {DEFAULT_WINDOW} blocks");
    println!("  Filters: wallet_address, policy_id, vkey");
    println!("  Storage backends: memory, sqlite");
}

fn cmd_check(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)?;
    let mut hooks = Hooks::new();
    for filter in config.filters.clone() {
        hooks.enable(Arc::new(filter.into_filter(None)))?;
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_run(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)?;
    telemetry::init_tracing(&config.log);

    let metrics = Arc::new(FollowerMetrics::noop());
    let mut hooks = Hooks::new();
    for filter in config.filters.clone() {
        hooks.enable(Arc::new(filter.into_filter(Some(Arc::clone(&metrics)))))?;
    }

    let (store, mirror): (Arc<dyn CheckpointStore>, Arc<dyn BlockMirror>) = match &config.storage {
        StorageConfig::Memory => {
            let storage = Arc::new(InMemoryStorage::new());
            (storage.clone() as Arc<dyn CheckpointStore>, storage as Arc<dyn BlockMirror>)
        }
        StorageConfig::Sqlite { path } => {
            let storage = Arc::new(SqliteStorage::open(path).await?);
            (storage.clone() as Arc<dyn CheckpointStore>, storage as Arc<dyn BlockMirror>)
        }
    };

    let (publisher, rx) = ChannelPublisher::new(BUS_CAPACITY);
    let publisher = Arc::new(publisher);

    let token = CancellationToken::new();
    let processor = Processor::new(
        mirror,
        RetryPolicy::new(config.retry.clone()),
        config.follower.topic.clone(),
    );
    let mut processor_task = {
        let token = token.clone();
        tokio::spawn(async move { processor.run(rx, token).await })
    };

    let connector = Arc::new(OgmiosConnector::new(config.ogmios.clone()));
    log_health(&connector).await;

    let follower = ChainFollower::new(
        config.follower.clone(),
        connector.clone(),
        publisher,
        store,
        hooks,
        Arc::clone(&metrics),
    );
    follower.resume_from_store().await?;
    follower.initialize().await?;
    follower.connect_and_start().await?;
    info!(follower = %config.follower.id, url = %config.ogmios.url(), "Follower running");

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    let mut processor_done = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                break;
            }
            _ = ticker.tick() => {
                let snap = metrics.snapshot();
                info!(
                    running = snap.running,
                    processed = snap.blocks_processed,
                    published = snap.blocks_published,
                    queued = snap.queue_size,
                    tip_height = snap.tip_height,
                    tip_synced = snap.tip_synced,
                    errors = snap.errors,
                    "Follower status"
                );
            }
            joined = &mut processor_task => {
                processor_done = true;
                match joined {
                    Ok(Ok(())) => warn!("Processor exited"),
                    Ok(Err(e)) => error!(error = %e, "Processor paused, stopping follower"),
                    Err(e) => error!(error = %e, "Processor task panicked"),
                }
                break;
            }
        }
    }

    follower.stop().await;
    token.cancel();
    if !processor_done {
        if let Err(e) = processor_task.await {
            warn!(error = %e, "Processor task did not finish cleanly");
        }
    }

    let health = log_health(&connector).await;

    let report = json!({
        "status": follower.status().await,
        "current_intersection": follower.current_intersection().await,
        "queued_intersection": follower.queued_intersection().await,
        "start_points": follower.start_points().await,
        "metrics": metrics.snapshot(),
        "ogmios_health": health,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Log Ogmios' `/health`. An unreachable endpoint is reported, not fatal.
async fn log_health(connector: &OgmiosConnector) -> Option<ServerHealth> {
    match connector.health().await {
        Ok(health) => {
            info!(
                connection = health.connection_status.as_deref().unwrap_or("unknown"),
                synchronization = health.network_synchronization,
                era = health.current_era.as_deref().unwrap_or("unknown"),
                tip = ?health.last_known_tip,
                "Ogmios health"
            );
            Some(health)
        }
        Err(e) => {
            warn!(error = %e, url = %connector.config().health_url(), "Ogmios health unavailable");
            None
        }
    }
}
