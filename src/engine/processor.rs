use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::filters::FilterPipeline;
use super::hash::{compute_backtest_hash, HashInputs};
use super::journal::{match_trades_fifo, size_executions, trades_from_executions};
use super::metrics::calculate_metrics;
use super::position_manager::PositionManager;
use super::rules::PositionRulePipeline;
use super::simulator::ExecutionSimulator;
use super::stepper::TimeStepper;
use super::types::{ExecutionConfig, ShareSizing, Signal, WalkForwardParams};
use super::Strategy;
use crate::config::{FiltersConfig, PositionManagerConfig};
use crate::data::cache::OhlcvCache;
use crate::data::{OhlcvFrame, OhlcvSource};
use crate::results::writer::{ResultsMeta, ResultsWriter, TradesData};

/// Results database name by environment: `backtest` in prod, `backtest-dev`
/// everywhere else.
pub fn get_backtest_database() -> String {
    let env = std::env::var("INFLUXDB3_ENVIRONMENT").unwrap_or_default();
    if env.eq_ignore_ascii_case("prod") {
        "backtest".to_string()
    } else {
        "backtest-dev".to_string()
    }
}

pub fn generate_backtest_id() -> String {
    Uuid::new_v4().to_string()
}

/// Full parameter set for one backtest run.
pub struct BacktestRequest {
    pub tickers: Vec<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub step_frequency: String,
    pub database: String,
    pub results_database: String,
    pub execution: ExecutionConfig,
    pub capital_per_trade: f64,
    pub risk_free_rate: f64,
    pub strategy_params: BTreeMap<String, Value>,
    pub backtest_id: String,
    pub walk_forward: WalkForwardParams,
    pub use_multiprocessing: bool,
    /// Worker pool size; defaults to `max(1, cpus - 2)`.
    pub max_processes: Option<usize>,
    pub initial_account_value: Option<f64>,
    pub trade_percentage: Option<f64>,
    pub filters: Option<FiltersConfig>,
    pub position_manager: Option<PositionManagerConfig>,
    pub portfolio_stage: Option<String>,
}

impl BacktestRequest {
    fn sizing(&self) -> ShareSizing {
        match (self.initial_account_value, self.trade_percentage) {
            (Some(initial_account_value), Some(trade_percentage)) => ShareSizing::AccountValue {
                initial_account_value,
                trade_percentage,
            },
            _ => ShareSizing::FixedCapital {
                capital_per_trade: self.capital_per_trade,
            },
        }
    }

    pub fn hash_id(&self) -> String {
        compute_backtest_hash(&HashInputs {
            strategy_params: &self.strategy_params,
            execution: &self.execution,
            step_frequency: &self.step_frequency,
            capital_per_trade: self.capital_per_trade,
            risk_free_rate: self.risk_free_rate,
            walk_forward: &self.walk_forward,
            position_manager: self.position_manager.as_ref(),
            filters: self.filters.as_ref(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub hash_id: String,
    pub backtest_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Orchestrates backtest execution across tickers: hashes the configuration,
/// fans the per-ticker pipeline out over a worker pool (or runs it inline),
/// and tallies the outcome.
pub struct BacktestProcessor {
    source: Arc<dyn OhlcvSource>,
    cache: Arc<OhlcvCache>,
    writer: Arc<ResultsWriter>,
}

impl BacktestProcessor {
    pub fn new(
        source: Arc<dyn OhlcvSource>,
        cache: Arc<OhlcvCache>,
        writer: Arc<ResultsWriter>,
    ) -> Self {
        Self {
            source,
            cache,
            writer,
        }
    }

    /// Run the backtest for every ticker. Cancellation stops new dispatch at
    /// the next ticker (and workers at the next bar) and clears this hash's
    /// cache entries before returning.
    pub fn process_tickers(
        &self,
        strategy: &dyn Strategy,
        request: &BacktestRequest,
        cancel: &CancellationToken,
    ) -> ProcessingSummary {
        let total = request.tickers.len();
        let hash_id = request.hash_id();

        if total == 0 {
            tracing::error!("No tickers provided");
            return ProcessingSummary {
                hash_id,
                backtest_id: request.backtest_id.clone(),
                total: 0,
                successful: 0,
                failed: 0,
            };
        }

        tracing::info!(
            "Processing backtest for {total} tickers with strategy={}, date_range={} to {}, backtest_id={}",
            strategy.strategy_name(),
            request.start_date.date_naive(),
            request.end_date.date_naive(),
            request.backtest_id
        );

        let successful = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let bar = ProgressBar::new(total as u64);

        let run_one = |ticker: &String| {
            if cancel.is_cancelled() {
                failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            match self.backtest_ticker_worker(ticker, strategy, request, &hash_id, cancel) {
                Ok(()) => {
                    successful.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("Backtest failed for {ticker}: {e:#}");
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            bar.inc(1);
        };

        if request.use_multiprocessing && total > 1 {
            let processes = request
                .max_processes
                .unwrap_or_else(default_max_processes)
                .max(1);
            match rayon::ThreadPoolBuilder::new().num_threads(processes).build() {
                Ok(pool) => pool.install(|| request.tickers.par_iter().for_each(run_one)),
                Err(e) => {
                    tracing::warn!("Failed to build worker pool ({e}), running sequentially");
                    request.tickers.iter().for_each(run_one);
                }
            }
        } else {
            tracing::info!("Processing tickers sequentially (multiprocessing disabled)...");
            request.tickers.iter().for_each(run_one);
        }
        bar.finish_and_clear();

        if cancel.is_cancelled() {
            tracing::info!("Backtest cancelled; clearing cache for hash {hash_id}");
            self.cache.clear_for_hash(&hash_id);
        }

        let summary = ProcessingSummary {
            hash_id,
            backtest_id: request.backtest_id.clone(),
            total,
            successful: successful.into_inner(),
            failed: failed.into_inner(),
        };
        print_summary(&summary);
        summary
    }

    /// One ticker end to end: load bars (cache first), step the strategy,
    /// filter, manage positions, journal, simulate execution, publish.
    fn backtest_ticker_worker(
        &self,
        ticker: &str,
        strategy: &dyn Strategy,
        request: &BacktestRequest,
        hash_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let frame = self.load_ticker_frame(ticker, request, hash_id)?;
        let mut data_cache: FxHashMap<String, OhlcvFrame> = FxHashMap::default();
        data_cache.insert(ticker.to_string(), frame);

        let stepper = TimeStepper::new(
            request.step_frequency.clone(),
            request.start_date,
            request.end_date,
        );
        let intervals = stepper.determine_step_intervals(&data_cache);
        let frame = &data_cache[ticker];

        let mut signals: Vec<Signal> = Vec::new();
        for asof in intervals {
            if cancel.is_cancelled() {
                bail!("cancelled");
            }
            let visible = frame.slice_through(asof);
            if visible.is_empty() {
                continue;
            }
            signals.extend(strategy.run_strategy(ticker, asof, &visible));
        }

        if let Some(filters_config) = &request.filters {
            let pipeline = FilterPipeline::from_config(filters_config)
                .context("invalid filter configuration")?;
            let before = signals.len();
            signals = pipeline.apply(signals, &data_cache);
            tracing::debug!(
                "Filters kept {}/{before} signals for {ticker}",
                signals.len()
            );
        }

        let meta = ResultsMeta {
            strategy_name: strategy.strategy_name().to_string(),
            ticker: ticker.to_string(),
            backtest_id: Some(request.backtest_id.clone()),
            hash_id: Some(hash_id.to_string()),
            strategy_params: Some(request.strategy_params.clone()),
            database: Some(request.results_database.clone()),
            portfolio_stage: request.portfolio_stage.clone(),
        };
        let simulator = ExecutionSimulator::new(request.execution.clone());
        let sizing = request.sizing();
        let frame = &data_cache[ticker];

        let (trades, trades_payload_written) = if let Some(pm_config) = &request.position_manager {
            let mut pm = PositionManager::new(PositionRulePipeline::from_config(pm_config));
            let managed = pm.apply(signals, &data_cache, cancel);
            let intents = size_executions(&managed, sizing);
            let trades =
                trades_from_executions(&intents, strategy.strategy_name(), Some(frame));
            let written = self
                .writer
                .write_trades(&TradesData::Executions(&intents), &meta);
            (trades, written)
        } else {
            let trades = match_trades_fifo(&signals, strategy.strategy_name(), sizing, Some(frame));
            let executed = simulator.apply_execution(trades.clone(), &data_cache);
            let written = self
                .writer
                .write_trades(&TradesData::Executed(&executed), &meta);
            (trades, written)
        };
        if !trades_payload_written {
            bail!("failed to enqueue trades");
        }

        let metrics = calculate_metrics(&trades, request.capital_per_trade, request.risk_free_rate);
        if !self.writer.write_metrics(&metrics, &meta) {
            bail!("failed to enqueue metrics");
        }

        if let Some(studies) = strategy.run_studies(ticker, frame) {
            if !self.writer.write_studies(&studies, &meta) {
                bail!("failed to enqueue studies");
            }
        }

        Ok(())
    }

    fn load_ticker_frame(
        &self,
        ticker: &str,
        request: &BacktestRequest,
        hash_id: &str,
    ) -> Result<OhlcvFrame> {
        if let Some(frame) = self.cache.load(hash_id, ticker) {
            return Ok(frame);
        }

        let df = self
            .source
            .query(ticker, request.start_date, request.end_date)
            .with_context(|| format!("OHLCV query failed for {ticker}"))?;
        let Some(df) = df else {
            bail!("No OHLCV data found for {ticker}");
        };
        let frame = OhlcvFrame::from_dataframe(&df)?;
        if frame.is_empty() {
            bail!("No OHLCV data found for {ticker}");
        }

        self.cache.store(hash_id, ticker, &frame);
        Ok(frame)
    }
}

fn default_max_processes() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_sub(2)
        .max(1)
}

fn print_summary(summary: &ProcessingSummary) {
    let rule = "=".repeat(50);
    println!("\n{rule}");
    println!("Backtest Processing Summary");
    println!("{rule}");
    println!("Hash ID: {}", summary.hash_id);
    println!("Backtest ID: {}", summary.backtest_id);
    println!("Total Tickers: {}", summary.total);
    println!("Successfully Processed: {}", summary.successful);
    println!("Failed: {}", summary.failed);
    println!("{rule}\n");
}
