use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use algo_backtest::data::cache::{CacheLimits, OhlcvCache};
use algo_backtest::data::kv::MemoryKv;
use algo_backtest::data::{MemoryOhlcvSource, OhlcvFrame};
use algo_backtest::engine::processor::{BacktestProcessor, BacktestRequest};
use algo_backtest::engine::types::{ExecutionConfig, Signal, WalkForwardParams};
use algo_backtest::engine::Strategy;
use algo_backtest::queue::MemoryBroker;
use algo_backtest::results::writer::ResultsWriter;

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

/// Daily bars from `(day, open, high, low, close)` tuples.
pub fn frame(days: &[(u32, f64, f64, f64, f64)]) -> OhlcvFrame {
    let mut times = Vec::new();
    let mut open = Vec::new();
    let mut high = Vec::new();
    let mut low = Vec::new();
    let mut close = Vec::new();
    let mut volume = Vec::new();
    for &(d, o, h, l, c) in days {
        times.push(day(d));
        open.push(o);
        high.push(h);
        low.push(l);
        close.push(c);
        volume.push(10_000);
    }
    OhlcvFrame::new(times, open, high, low, close, volume).unwrap()
}

/// Emits a fixed script of signals, each on the step matching its
/// `signal_time`.
pub struct ScriptedStrategy {
    pub name: String,
    pub signals: Vec<Signal>,
}

impl ScriptedStrategy {
    pub fn new(name: &str, signals: Vec<Signal>) -> Self {
        Self {
            name: name.to_string(),
            signals,
        }
    }
}

impl Strategy for ScriptedStrategy {
    fn strategy_name(&self) -> &str {
        &self.name
    }

    fn run_strategy(&self, ticker: &str, asof: DateTime<Utc>, _ohlcv: &OhlcvFrame) -> Vec<Signal> {
        self.signals
            .iter()
            .filter(|s| s.ticker == ticker && s.signal_time == asof)
            .cloned()
            .collect()
    }
}

/// Everything one processor-level test needs, wired against the in-memory
/// stores.
pub struct Harness {
    pub source: Arc<MemoryOhlcvSource>,
    pub broker: Arc<MemoryBroker>,
    pub cache: Arc<OhlcvCache>,
    pub processor: BacktestProcessor,
}

pub fn harness() -> Harness {
    let source = Arc::new(MemoryOhlcvSource::new());
    let broker = Arc::new(MemoryBroker::new());
    let cache = Arc::new(OhlcvCache::new(
        Arc::new(MemoryKv::new()),
        CacheLimits::default(),
    ));
    let writer = Arc::new(ResultsWriter::new(broker.clone()));
    let processor = BacktestProcessor::new(source.clone(), cache.clone(), writer);
    Harness {
        source,
        broker,
        cache,
        processor,
    }
}

pub fn request(tickers: &[&str], start: u32, end: u32) -> BacktestRequest {
    BacktestRequest {
        tickers: tickers.iter().map(ToString::to_string).collect(),
        start_date: day(start),
        end_date: day(end),
        step_frequency: "daily".to_string(),
        database: "ohlcv".to_string(),
        results_database: "backtest-dev".to_string(),
        execution: ExecutionConfig::default(),
        capital_per_trade: 10_000.0,
        risk_free_rate: 0.04,
        strategy_params: BTreeMap::new(),
        backtest_id: "bt-e2e".to_string(),
        walk_forward: WalkForwardParams::default(),
        use_multiprocessing: false,
        max_processes: None,
        initial_account_value: None,
        trade_percentage: None,
        filters: None,
        position_manager: None,
        portfolio_stage: None,
    }
}
