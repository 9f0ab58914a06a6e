//! Stakeroom server binary
//!
//! Loads configuration, opens the store, runs the settlement engine and
//! serves the HTTP API until shutdown.

use clap::{Parser, Subcommand};
use stakeroom::{
    api::{ApiServer, AppState},
    common::config::{generate_sample_config, ConfigLoader},
    config::StorageBackend,
    metrics::EngineMetrics,
    open_store, Clock, KvStore, PriceBook, SessionCoordinator, SettlementEngine, StakeroomConfig,
    StoredResults, SystemClock,
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Stakeroom CLI
#[derive(Parser)]
#[command(name = "stakeroom")]
#[command(about = "Wager, room and ledger engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for RocksDB storage
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Keep all state in memory (lost on exit)
    #[arg(long)]
    memory: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and settlement engine (default)
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply every outcome that is already due, then exit
    Sweep,

    /// Write a sample configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "stakeroom.toml")]
        output: String,
    },
}

struct Engine {
    coordinator: Arc<SessionCoordinator>,
    prices: Arc<PriceBook>,
    settlement: Arc<SettlementEngine>,
    clock: Arc<dyn Clock>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Commands::GenerateConfig { output }) = &cli.command {
        generate_sample_config(output)?;
        println!("✅ Sample configuration written to {}", output);
        return Ok(());
    }

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_directory = dir;
    }
    if cli.memory {
        config.storage.backend = StorageBackend::Memory;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    match cli.command {
        Some(Commands::Sweep) => run_sweep(config).await,
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config).await
        }
        None => run_server(config).await,
        Some(Commands::GenerateConfig { .. }) => Ok(()),
    }
}

fn build_engine(
    config: &StakeroomConfig,
    events: Option<mpsc::UnboundedSender<stakeroom::SettlementEvent>>,
) -> Result<Engine, Box<dyn std::error::Error>> {
    info!("🚀 Starting Stakeroom engine");
    info!("   Storage: {:?} at {}", config.storage.backend, config.storage.data_directory);

    let store: Arc<dyn KvStore> = open_store(&config.storage)?;
    let prices = Arc::new(PriceBook::persistent(store.clone())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(EngineMetrics::new()?);

    let mut coordinator = SessionCoordinator::new(store, prices.clone(), clock.clone(), config, metrics);
    if let Some(events) = events {
        coordinator = coordinator.with_settlement_events(events);
    }
    let coordinator = Arc::new(coordinator);

    let settlement = Arc::new(SettlementEngine::new(
        coordinator.clone(),
        prices.clone(),
        Arc::new(StoredResults::new(coordinator.rooms().clone())),
        clock.clone(),
        config.settlement.clone(),
    ));

    Ok(Engine {
        coordinator,
        prices,
        settlement,
        clock,
    })
}

async fn run_server(config: StakeroomConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = build_engine(&config, Some(tx))?;

    let worker = engine.settlement.clone().spawn(rx);
    info!("⚙️  Settlement engine running (scan every {}ms)", config.settlement.scan_interval_ms);

    let state = Arc::new(AppState {
        coordinator: engine.coordinator.clone(),
        prices: engine.prices.clone(),
        clock: engine.clock.clone(),
        admin_api_key: config.server.admin_api_key.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let served = ApiServer::new(config.server.clone(), state).run().await;

    engine.settlement.stop();
    if let Err(e) = worker.await {
        tracing::warn!("Settlement engine task ended abnormally: {}", e);
    }
    served
}

async fn run_sweep(config: StakeroomConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = build_engine(&config, None)?;
    let report = engine.settlement.sweep_once().await;
    info!(
        wagers_settled = report.wagers_settled,
        wagers_voided = report.wagers_voided,
        wagers_waiting = report.wagers_waiting,
        rooms_settled = report.rooms_settled,
        rooms_waiting = report.rooms_waiting,
        failures = report.failures,
        "✅ Sweep complete"
    );
    Ok(())
}
