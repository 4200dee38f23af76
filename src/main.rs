// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

use algo_backtest::config;
use algo_backtest::data::cache::{CacheLimits, OhlcvCache};
use algo_backtest::data::kv::MemoryKv;
use algo_backtest::data::{MemoryExecutionStore, MemoryOhlcvSource};
use algo_backtest::engine::portfolio::{
    run_portfolio_phase, PortfolioPhaseDeps, PortfolioRulePipeline,
};
use algo_backtest::engine::processor::get_backtest_database;
use algo_backtest::queue::MemoryBroker;
use algo_backtest::results::writer::ResultsWriter;

/// Portfolio manager phase-2 for backtest trades.
#[derive(Parser, Debug)]
#[command(name = "portfolio-phase2")]
struct Args {
    /// Backtest hash ID to include (can be specified multiple times)
    #[arg(long = "hash", required = true)]
    hashes: Vec<String>,

    /// Portfolio manager YAML config name or path
    #[arg(long)]
    portfolio_manager: String,

    /// Results database with phase-1 trades (default: by environment)
    #[arg(long)]
    database: Option<String>,

    /// Database for OHLCV data
    #[arg(long, default_value = "ohlcv")]
    ohlcv_database: String,

    /// Initial account value for the portfolio
    #[arg(long, default_value_t = 10_000.0)]
    initial_account_value: f64,

    /// Optional OHLCV cache config YAML
    #[arg(long)]
    cache_config: Option<PathBuf>,
}

/// Shared stores for a phase-2 run. The embedded in-memory backends stand in
/// for the Redis and time-series services the deployment wires up.
fn build_deps(cache_limits: CacheLimits) -> PortfolioPhaseDeps {
    let broker = Arc::new(MemoryBroker::new());
    PortfolioPhaseDeps {
        broker: broker.clone(),
        cache: Arc::new(OhlcvCache::new(Arc::new(MemoryKv::new()), cache_limits)),
        executions: Arc::new(MemoryExecutionStore::new()),
        ohlcv_source: Arc::new(MemoryOhlcvSource::new()),
        writer: Arc::new(ResultsWriter::new(broker)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            EnvFilter::try_new(level)
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let database = args
        .database
        .clone()
        .unwrap_or_else(get_backtest_database);

    let pipeline = match config::load_portfolio_manager_config(&args.portfolio_manager) {
        Ok(cfg) => PortfolioRulePipeline::from_config(&cfg),
        Err(e) => {
            tracing::error!("Failed to load portfolio manager config: {e}");
            std::process::exit(1);
        }
    };

    let cache_limits = args
        .cache_config
        .as_deref()
        .map_or_else(CacheLimits::default, CacheLimits::from_yaml_file);
    let deps = build_deps(cache_limits);

    tokio::select! {
        result = run_portfolio_phase(
            &deps,
            &args.hashes,
            pipeline,
            args.initial_account_value,
            &database,
        ) => {
            match result {
                Ok(_) => Ok(()),
                Err(e) => {
                    tracing::error!("Portfolio phase-2 failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Portfolio phase interrupted by user");
            for hash_id in &args.hashes {
                deps.cache.clear_for_hash(hash_id);
            }
            std::process::exit(1);
        }
    }
}
