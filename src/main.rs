//! Service entry point.
//!
//! 1. Parse CLI flags and load the JSON configuration.
//! 2. Initialise tracing, optionally expose Prometheus metrics.
//! 3. Start the reliability engine and log a periodic status line.
//! 4. On Ctrl-C, stop every component within the shutdown grace period.

use clap::Parser;
use eyre::{Result, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tx_sentinel::{
    clock::SystemClock, config::EngineConfig, metrics::start_metrics_server,
    providers::EthersClientFactory, ReliabilityEngine,
};

#[derive(Debug, Parser)]
#[command(name = "tx-sentinel", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "TX_SENTINEL_CONFIG", default_value = "config/engine.json")]
    config: PathBuf,

    /// Overrides `metrics.port` from the configuration.
    #[arg(long, env = "TX_SENTINEL_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Seconds between status log lines; 0 disables them.
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .wrap_err("Invalid log filter")?
        .add_directive("ethers_providers=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::load_from_file(&cli.config).await?;
    init_tracing(&config.log_level)?;
    info!(config = %cli.config.display(), chain = %config.chain, "Configuration loaded");

    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    let metrics_server = if config.metrics.enabled {
        Some(start_metrics_server(config.metrics.host.clone(), config.metrics.port)?)
    } else {
        None
    };

    let engine = Arc::new(
        ReliabilityEngine::new(config, Arc::new(EthersClientFactory::new()), Arc::new(SystemClock))
            .wrap_err("Failed to build reliability engine")?,
    );
    engine.start()?;

    let status_task = (cli.status_interval > 0).then(|| {
        let engine = engine.clone();
        let period = Duration::from_secs(cli.status_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                log_status(&engine);
            }
        })
    });

    signal::ctrl_c().await.wrap_err("Failed to listen for Ctrl-C")?;
    info!("SIGINT - shutting down");

    if let Some(task) = status_task {
        task.abort();
    }
    if let Err(e) = engine.stop().await {
        error!(error = %e, "Engine did not stop cleanly");
    }
    if let Some(server) = metrics_server {
        server.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

fn log_status(engine: &ReliabilityEngine) {
    let metrics = engine.get_metrics();
    info!(
        healthy_nodes = %metrics.get("healthy_nodes").cloned().unwrap_or_default(),
        total_nodes = %metrics.get("total_nodes").cloned().unwrap_or_default(),
        tracked = %metrics.get("tracked_transactions").cloned().unwrap_or_default(),
        active_alerts = %metrics.get("active_alerts").cloned().unwrap_or_default(),
        "Engine status"
    );
    match engine.get_mempool_analysis() {
        Ok(analysis) => info!(
            congestion = %analysis.congestion.level,
            optimal_gwei = analysis.optimal_gas_price_gwei,
            pending = analysis.pending_transactions,
            stale = analysis.stale,
            "Mempool status"
        ),
        Err(e) => warn!(error = %e, "No mempool analysis yet"),
    }
}
