use anyhow::Result;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::config::{PortfolioManagerConfig, PortfolioRuleSpec};
use crate::data::cache::OhlcvCache;
use crate::data::{ExecutionRecord, ExecutionStore, OhlcvFrame, OhlcvSource};
use crate::queue::QueueBroker;
use crate::results::writer::{ResultsMeta, ResultsWriter, TradesData, BACKTEST_TRADES_QUEUE_NAME};

const PHASE1_QUEUE_WAIT: StdDuration = StdDuration::from_secs(60);
const PHASE1_DATA_WAIT: StdDuration = StdDuration::from_secs(30);
const POLL_INTERVAL: StdDuration = StdDuration::from_secs(2);

/// Account view a portfolio rule evaluates an execution against. `ohlcv`
/// holds the bars for the execution's ticker when available.
pub struct PortfolioRuleContext<'a> {
    pub execution: &'a ExecutionRecord,
    pub account_value: f64,
    pub deployed_capital: f64,
    pub ohlcv: Option<&'a OhlcvFrame>,
}

/// Outcome of one rule: approve/reject plus an optional share resize.
#[derive(Debug, Clone, Default)]
pub struct PortfolioDecision {
    pub reject: bool,
    pub resized_shares: Option<f64>,
}

/// Portfolio-level rules, same closed-variant shape as the position rules.
#[derive(Debug, Clone)]
pub enum PortfolioRule {
    /// Reject entries that would push deployed capital past
    /// `max_deployed_pct` of the account value.
    MaxCapitalDeployed { max_deployed_pct: f64 },
    /// Size entries as `floor(account_value * fraction_of_equity / price)`.
    FractionalPositionSize { fraction_of_equity: f64 },
}

impl PortfolioRule {
    pub fn name(&self) -> &'static str {
        match self {
            PortfolioRule::MaxCapitalDeployed { .. } => "max_capital_deployed",
            PortfolioRule::FractionalPositionSize { .. } => "fractional_position_size",
        }
    }

    pub fn evaluate(&self, ctx: &PortfolioRuleContext<'_>) -> Result<PortfolioDecision> {
        match self {
            PortfolioRule::MaxCapitalDeployed { max_deployed_pct } => {
                let price = ctx.execution.intent.price;
                let shares = ctx.execution.intent.shares;
                let committed = ctx.deployed_capital + shares * price;
                if committed > max_deployed_pct * ctx.account_value {
                    return Ok(PortfolioDecision {
                        reject: true,
                        resized_shares: None,
                    });
                }
                Ok(PortfolioDecision::default())
            }
            PortfolioRule::FractionalPositionSize { fraction_of_equity } => {
                let price = ctx.execution.intent.price;
                if price <= 0.0 {
                    return Ok(PortfolioDecision {
                        reject: true,
                        resized_shares: None,
                    });
                }
                let shares = (ctx.account_value * fraction_of_equity / price).floor();
                Ok(PortfolioDecision {
                    reject: shares <= 0.0,
                    resized_shares: Some(shares),
                })
            }
        }
    }
}

/// Ordered portfolio rules; sizing rules run before capital gates see the
/// final share count.
pub struct PortfolioRulePipeline {
    rules: Vec<PortfolioRule>,
}

impl PortfolioRulePipeline {
    pub fn new(rules: Vec<PortfolioRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(config: &PortfolioManagerConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|spec| match spec {
                PortfolioRuleSpec::MaxCapitalDeployed(p) => PortfolioRule::MaxCapitalDeployed {
                    max_deployed_pct: p.max_deployed_pct,
                },
                PortfolioRuleSpec::FractionalPositionSize(p) => {
                    PortfolioRule::FractionalPositionSize {
                        fraction_of_equity: p.fraction_of_equity,
                    }
                }
            })
            .collect();
        Self::new(rules)
    }

    /// Evaluate all rules for an entry execution. Sizing updates apply to the
    /// context as later rules run; any rejection (or rule error) filters the
    /// execution.
    fn decide_entry(
        &self,
        execution: &mut ExecutionRecord,
        account_value: f64,
        deployed: f64,
        ohlcv: Option<&OhlcvFrame>,
    ) -> bool {
        for rule in &self.rules {
            let ctx = PortfolioRuleContext {
                execution,
                account_value,
                deployed_capital: deployed,
                ohlcv,
            };
            match rule.evaluate(&ctx) {
                Ok(decision) => {
                    if decision.reject {
                        tracing::debug!(
                            "Portfolio rule {} rejected {} at {}",
                            rule.name(),
                            execution.intent.ticker,
                            execution.intent.signal_time
                        );
                        return false;
                    }
                    if let Some(shares) = decision.resized_shares {
                        execution.intent.shares = shares;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Portfolio rule {} raised error for {} at {}: {e}",
                        rule.name(),
                        execution.intent.ticker,
                        execution.intent.signal_time
                    );
                    return false;
                }
            }
        }
        true
    }
}

/// Applies portfolio rules across every phase-1 execution in time order,
/// tracking deployed capital and realized PnL.
pub struct PortfolioManager {
    pipeline: PortfolioRulePipeline,
    initial_account_value: f64,
}

impl PortfolioManager {
    pub fn new(pipeline: PortfolioRulePipeline, initial_account_value: f64) -> Self {
        Self {
            pipeline,
            initial_account_value,
        }
    }

    /// Filter and resize executions. Entries deploy capital while their FIFO
    /// lot is open and release it (realizing PnL into the account) when the
    /// matching exit arrives; exits without an approved open lot are
    /// filtered.
    pub fn apply(
        &self,
        executions: Vec<ExecutionRecord>,
        ohlcv_by_ticker: &FxHashMap<String, OhlcvFrame>,
    ) -> Vec<ExecutionRecord> {
        struct Lot {
            shares: f64,
            price: f64,
            multiplier: f64,
        }

        let mut ordered = executions;
        ordered.sort_by_key(|e| e.intent.signal_time);

        let mut account_value = self.initial_account_value;
        let mut deployed = 0.0_f64;
        let mut open_lots: FxHashMap<String, VecDeque<Lot>> = FxHashMap::default();
        let mut approved = Vec::new();

        for mut execution in ordered {
            if execution.intent.action.is_entry() {
                let ohlcv = ohlcv_by_ticker.get(&execution.intent.ticker);
                if !self
                    .pipeline
                    .decide_entry(&mut execution, account_value, deployed, ohlcv)
                {
                    continue;
                }
                let lot = Lot {
                    shares: execution.intent.shares,
                    price: execution.intent.price,
                    multiplier: execution.side().multiplier(),
                };
                deployed += lot.shares * lot.price;
                open_lots
                    .entry(execution.intent.ticker.clone())
                    .or_default()
                    .push_back(lot);
                approved.push(execution);
            } else {
                let Some(lots) = open_lots.get_mut(&execution.intent.ticker) else {
                    continue;
                };
                let mut remaining = execution.intent.shares;
                let mut released = 0.0;
                while remaining > 0.0 {
                    let Some(lot) = lots.front_mut() else {
                        break;
                    };
                    let closed = remaining.min(lot.shares);
                    deployed -= closed * lot.price;
                    account_value +=
                        closed * (execution.intent.price - lot.price) * lot.multiplier;
                    lot.shares -= closed;
                    remaining -= closed;
                    released += closed;
                    if lot.shares <= 0.0 {
                        lots.pop_front();
                    }
                }
                if released <= 0.0 {
                    continue;
                }
                execution.intent.shares = released;
                approved.push(execution);
            }
        }

        deployed = deployed.max(0.0);
        tracing::debug!(
            "Portfolio manager finished: account_value={account_value:.2}, deployed={deployed:.2}"
        );
        approved
    }
}

/// Shared stores the phase-2 run works against.
pub struct PortfolioPhaseDeps {
    pub broker: Arc<dyn QueueBroker>,
    pub cache: Arc<OhlcvCache>,
    pub executions: Arc<dyn ExecutionStore>,
    pub ohlcv_source: Arc<dyn OhlcvSource>,
    pub writer: Arc<ResultsWriter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortfolioPhaseSummary {
    pub total_signals: usize,
    pub approved_signals: usize,
}

/// Wait for the phase-1 trades queue to drain of items for these hashes.
async fn wait_for_phase1_completion(deps: &PortfolioPhaseDeps, hashes: &[String]) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        let pending = deps.broker.peek(BACKTEST_TRADES_QUEUE_NAME, 100);
        let has_phase1 = pending.iter().any(|item_id| {
            deps.broker
                .get_data(BACKTEST_TRADES_QUEUE_NAME, item_id)
                .is_some_and(|data| {
                    data.get("portfolio_stage").and_then(|s| s.as_str()) == Some("phase1")
                        && data
                            .get("hash_id")
                            .and_then(|h| h.as_str())
                            .is_some_and(|h| hashes.iter().any(|want| want == h))
                })
        });
        if !has_phase1 {
            return true;
        }

        let elapsed = started.elapsed();
        if elapsed >= PHASE1_QUEUE_WAIT {
            tracing::warn!(
                "Phase-1 trades queue still has pending items for hashes {hashes:?} after \
                 waiting {} seconds",
                elapsed.as_secs()
            );
            return false;
        }
        tracing::info!(
            "Waiting for phase-1 trades to be flushed for hashes {hashes:?} (elapsed={}s)...",
            elapsed.as_secs()
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Load phase-1 executions per hash, polling until data arrives or the wait
/// budget runs out. Hashes with no data are skipped with a warning.
async fn load_phase1_executions(
    deps: &PortfolioPhaseDeps,
    hashes: &[String],
) -> Vec<ExecutionRecord> {
    let mut all = Vec::new();
    for hash_id in hashes {
        let started = tokio::time::Instant::now();
        loop {
            match deps.executions.query_executions(hash_id) {
                Ok(records) if !records.is_empty() => {
                    all.extend(records);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Error querying phase-1 executions for {hash_id}: {e}");
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= PHASE1_DATA_WAIT {
                tracing::warn!(
                    "No phase-1 executions found for hash {hash_id} after waiting {} seconds",
                    elapsed.as_secs()
                );
                break;
            }
            tracing::info!(
                "Waiting for phase-1 executions for hash {hash_id} (elapsed={}s)...",
                elapsed.as_secs()
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    tracing::info!(
        "Loaded {} phase-1 executions from {} hash(es)",
        all.len(),
        hashes.len()
    );
    all
}

/// OHLCV for every ticker in the executions: cache-first by the lead hash,
/// misses filled from the source and written back.
fn load_ohlcv_for_executions(
    deps: &PortfolioPhaseDeps,
    executions: &[ExecutionRecord],
    hashes: &[String],
) -> FxHashMap<String, OhlcvFrame> {
    let mut ohlcv_by_ticker: FxHashMap<String, OhlcvFrame> = FxHashMap::default();
    if executions.is_empty() {
        return ohlcv_by_ticker;
    }

    let mut tickers: Vec<String> = executions
        .iter()
        .map(|e| e.intent.ticker.clone())
        .collect();
    tickers.sort();
    tickers.dedup();

    let lead_hash = hashes.first();
    if let Some(hash_id) = lead_hash {
        for ticker in &tickers {
            if let Some(frame) = deps.cache.load(hash_id, ticker) {
                ohlcv_by_ticker.insert(ticker.clone(), frame);
            }
        }
    }

    let missing: Vec<&String> = tickers
        .iter()
        .filter(|t| !ohlcv_by_ticker.contains_key(*t))
        .collect();
    if !missing.is_empty() {
        let start = executions.iter().map(|e| e.intent.signal_time).min();
        let end = executions.iter().map(|e| e.intent.signal_time).max();
        if let (Some(start), Some(end)) = (start, end) {
            for ticker in missing {
                match deps.ohlcv_source.query(ticker, start, end) {
                    Ok(Some(df)) => match OhlcvFrame::from_dataframe(&df) {
                        Ok(frame) if !frame.is_empty() => {
                            if let Some(hash_id) = lead_hash {
                                deps.cache.store(hash_id, ticker, &frame);
                            }
                            ohlcv_by_ticker.insert(ticker.clone(), frame);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Bad OHLCV frame for {ticker}: {e}"),
                    },
                    Ok(None) => tracing::warn!("No OHLCV data found for {ticker}"),
                    Err(e) => tracing::warn!("OHLCV query failed for {ticker}: {e}"),
                }
            }
        }
    }

    tracing::info!("Loaded OHLCV data for {} ticker(s)", ohlcv_by_ticker.len());
    ohlcv_by_ticker
}

/// Phase-2: wait out phase-1, load its executions, apply portfolio rules,
/// and re-enqueue the approved rows as final. Returns the signal counts.
pub async fn run_portfolio_phase(
    deps: &PortfolioPhaseDeps,
    hashes: &[String],
    pipeline: PortfolioRulePipeline,
    initial_account_value: f64,
    database: &str,
) -> Result<PortfolioPhaseSummary> {
    tracing::info!("Portfolio Manager Phase-2: database={database}, hashes={hashes:?}");

    wait_for_phase1_completion(deps, hashes).await;

    let executions = load_phase1_executions(deps, hashes).await;
    if executions.is_empty() {
        tracing::warn!("No phase-1 executions found for given hashes");
        return Ok(PortfolioPhaseSummary::default());
    }
    let total_signals = executions.len();

    let ohlcv_by_ticker = load_ohlcv_for_executions(deps, &executions, hashes);

    let manager = PortfolioManager::new(pipeline, initial_account_value);
    let approved = manager.apply(executions, &ohlcv_by_ticker);
    if approved.is_empty() {
        tracing::warn!("Portfolio manager filtered all executions");
        return Ok(PortfolioPhaseSummary {
            total_signals,
            approved_signals: 0,
        });
    }
    tracing::info!(
        "Portfolio manager approved {} of {total_signals} executions",
        approved.len()
    );

    // Group approved rows by (strategy, ticker, hash) and re-enqueue final.
    let mut groups: FxHashMap<(String, String, String), Vec<&ExecutionRecord>> =
        FxHashMap::default();
    for record in &approved {
        groups
            .entry((
                record.strategy.clone(),
                record.intent.ticker.clone(),
                record.hash_id.clone(),
            ))
            .or_default()
            .push(record);
    }

    for ((strategy_name, ticker, hash_id), records) in groups {
        let intents: Vec<_> = records.iter().map(|r| r.intent.clone()).collect();
        let meta = ResultsMeta {
            strategy_name: strategy_name.clone(),
            ticker: ticker.clone(),
            backtest_id: None,
            hash_id: Some(hash_id.clone()),
            strategy_params: None,
            database: Some(database.to_string()),
            portfolio_stage: Some("final".to_string()),
        };
        if deps
            .writer
            .write_trades(&TradesData::Executions(&intents), &meta)
        {
            tracing::info!(
                "Enqueued {} portfolio-approved executions for {ticker} / {strategy_name} / {hash_id}",
                intents.len()
            );
        } else {
            tracing::error!(
                "Failed to enqueue portfolio-approved executions for {ticker} / {strategy_name} / {hash_id}"
            );
        }
    }

    let summary = PortfolioPhaseSummary {
        total_signals,
        approved_signals: approved.len(),
    };
    print_phase_summary(hashes, &summary);
    Ok(summary)
}

fn print_phase_summary(hashes: &[String], summary: &PortfolioPhaseSummary) {
    let rule = "=".repeat(50);
    println!("\n{rule}");
    println!("Portfolio Manager Phase-2 Summary");
    println!("{rule}");
    match hashes {
        [single] => println!("Hash ID: {single}"),
        many => println!("Hash IDs: {}", many.join(", ")),
    }
    println!("Total Signals: {}", summary.total_signals);
    println!("Signals Sent: {}", summary.approved_signals);
    println!(
        "Signals Filtered: {}",
        summary.total_signals - summary.approved_signals
    );
    println!("{rule}\n");
}
