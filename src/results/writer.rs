use chrono::{DateTime, SecondsFormat, Utc};
use garde::Validate;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::schema::{
    BacktestMetricsPayload, BacktestStudiesPayload, BacktestTradesPayload, TimeSeriesData,
};
use crate::engine::types::{
    BacktestMetrics, ExecutedTrade, ExecutionIntent, JournalAction, JournalRow, Side, StudySeries,
};
use crate::queue::QueueBroker;

pub const BACKTEST_TRADES_QUEUE_NAME: &str = "backtest_trades_queue";
pub const BACKTEST_METRICS_QUEUE_NAME: &str = "backtest_metrics_queue";
pub const BACKTEST_STUDIES_QUEUE_NAME: &str = "backtest_studies_queue";
pub const BACKTEST_QUEUE_TTL: Duration = Duration::from_secs(3_600);

/// Run-level metadata attached to every published payload.
#[derive(Debug, Clone, Default)]
pub struct ResultsMeta {
    pub strategy_name: String,
    pub ticker: String,
    pub backtest_id: Option<String>,
    pub hash_id: Option<String>,
    pub strategy_params: Option<BTreeMap<String, Value>>,
    pub database: Option<String>,
    pub portfolio_stage: Option<String>,
}

impl ResultsMeta {
    fn item_id(&self, suffix: &str) -> String {
        let backtest_id = self.backtest_id.as_deref().unwrap_or("no_id");
        format!("{}_{}_{backtest_id}{suffix}", self.ticker, self.strategy_name)
    }
}

/// Trades input in either journaling shape: executed round-trip trades
/// (legacy matching) or PM-managed execution intents.
pub enum TradesData<'a> {
    Executed(&'a [ExecutedTrade]),
    Executions(&'a [ExecutionIntent]),
}

/// Validates result payloads and enqueues them to the three backtest result
/// queues. Broker failures are logged and reported through the boolean
/// return, never raised.
pub struct ResultsWriter {
    broker: Arc<dyn QueueBroker>,
}

impl ResultsWriter {
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self { broker }
    }

    pub fn write_trades(&self, trades: &TradesData<'_>, meta: &ResultsMeta) -> bool {
        let journal_rows = match trades {
            TradesData::Executed(executed) => {
                if executed.is_empty() {
                    tracing::debug!("No trades to enqueue for {}", meta.ticker);
                    return true;
                }
                journal_rows_from_trades(executed, &meta.strategy_name)
            }
            TradesData::Executions(intents) => {
                if intents.is_empty() {
                    tracing::debug!("No executions to enqueue for {}", meta.ticker);
                    return true;
                }
                journal_rows_from_executions(intents, &meta.strategy_name)
            }
        };
        if journal_rows.is_empty() {
            tracing::debug!("No journal rows produced for {}", meta.ticker);
            return true;
        }

        let data = journal_rows_to_time_series(&journal_rows);
        let payload = BacktestTradesPayload {
            ticker: meta.ticker.clone(),
            strategy_name: meta.strategy_name.clone(),
            backtest_id: meta.backtest_id.clone(),
            hash_id: meta.hash_id.clone(),
            strategy_params: meta.strategy_params.clone(),
            data,
            database: meta.database.clone(),
            portfolio_stage: meta.portfolio_stage.clone(),
        };
        if let Err(e) = payload.validate() {
            tracing::error!(
                "Validation error building backtest trades payload for {} / {}: {e}",
                meta.ticker,
                meta.strategy_name
            );
            return false;
        }

        tracing::debug!(
            "Writing {} journal rows to queue for {}",
            journal_rows.len(),
            meta.ticker
        );
        self.enqueue(BACKTEST_TRADES_QUEUE_NAME, &meta.item_id(""), &payload)
    }

    pub fn write_metrics(&self, metrics: &BacktestMetrics, meta: &ResultsMeta) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        let mut data = TimeSeriesData {
            datetime: vec![now_ms],
            columns: BTreeMap::new(),
        };
        data.insert_column("total_trades", json!([metrics.total_trades]));
        data.insert_column("total_profit", json!([round2(metrics.total_profit)]));
        data.insert_column(
            "total_profit_pct",
            json!([round2(metrics.total_profit_pct)]),
        );
        data.insert_column("max_drawdown", json!([round2(metrics.max_drawdown)]));
        data.insert_column("sharpe_ratio", json!([round4(metrics.sharpe_ratio)]));
        data.insert_column("avg_efficiency", json!([round2(metrics.avg_efficiency)]));
        data.insert_column("avg_return_pct", json!([round2(metrics.avg_return_pct)]));
        data.insert_column("avg_time_held", json!([round2(metrics.avg_time_held)]));
        data.insert_column("win_rate", json!([round2(metrics.win_rate)]));
        data.insert_column("strategy", json!([meta.strategy_name]));
        if let Some(backtest_id) = &meta.backtest_id {
            data.insert_column("backtest_id", json!([backtest_id]));
        }
        if let Some(hash_id) = &meta.hash_id {
            data.insert_column("hash_id", json!([hash_id]));
        }

        let payload = BacktestMetricsPayload {
            ticker: meta.ticker.clone(),
            strategy_name: meta.strategy_name.clone(),
            backtest_id: meta.backtest_id.clone(),
            hash_id: meta.hash_id.clone(),
            data,
            database: meta.database.clone(),
        };
        if let Err(e) = payload.validate() {
            tracing::error!(
                "Validation error building backtest metrics payload for {} / {}: {e}",
                meta.ticker,
                meta.strategy_name
            );
            return false;
        }

        tracing::debug!("Writing metrics to queue for {}", meta.ticker);
        self.enqueue(
            BACKTEST_METRICS_QUEUE_NAME,
            &meta.item_id("_metrics"),
            &payload,
        )
    }

    pub fn write_studies(&self, studies: &StudySeries, meta: &ResultsMeta) -> bool {
        if studies.is_empty() {
            tracing::debug!("No studies to enqueue for {}", meta.ticker);
            return true;
        }

        let mut data = TimeSeriesData {
            datetime: studies
                .times
                .iter()
                .map(DateTime::timestamp_millis)
                .collect(),
            columns: BTreeMap::new(),
        };
        for (name, values) in &studies.columns {
            // Entirely-NaN study columns carry no information downstream.
            if values.iter().all(|v| v.is_nan()) {
                continue;
            }
            let sanitized: Vec<f64> = values
                .iter()
                .map(|v| if v.is_nan() { 0.0 } else { *v })
                .collect();
            data.insert_column(name.clone(), json!(sanitized));
        }

        let payload = BacktestStudiesPayload {
            ticker: meta.ticker.clone(),
            strategy_name: meta.strategy_name.clone(),
            backtest_id: meta.backtest_id.clone(),
            hash_id: meta.hash_id.clone(),
            strategy_params: meta.strategy_params.clone(),
            data,
            database: meta.database.clone(),
        };
        if let Err(e) = payload.validate() {
            tracing::error!(
                "Validation error building backtest studies payload for {} / {}: {e}",
                meta.ticker,
                meta.strategy_name
            );
            return false;
        }

        tracing::debug!(
            "Writing {} study rows to queue for {}",
            studies.times.len(),
            meta.ticker
        );
        self.enqueue(
            BACKTEST_STUDIES_QUEUE_NAME,
            &meta.item_id("_studies"),
            &payload,
        )
    }

    fn enqueue<T: serde::Serialize>(&self, queue: &str, item_id: &str, payload: &T) -> bool {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Error serializing payload for {item_id}: {e}");
                return false;
            }
        };
        let success = self
            .broker
            .enqueue(queue, item_id, &value, BACKTEST_QUEUE_TTL);
        if success {
            tracing::debug!("Enqueued {item_id} to {queue}");
        } else {
            tracing::error!("Failed to enqueue {item_id} to {queue}");
        }
        success
    }
}

/// Deterministic 16-hex id for one journal row.
pub fn compute_execution_id(
    ticker: &str,
    strategy: &str,
    trade_id: Option<u32>,
    timestamp: DateTime<Utc>,
    side: Side,
    action: JournalAction,
    shares: f64,
    price: f64,
) -> String {
    let ts_str = timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    let trade_id_str = trade_id.map(|id| id.to_string()).unwrap_or_default();
    let raw = format!(
        "{ticker}|{strategy}|{trade_id_str}|{ts_str}|{}|{}|{shares}|{price}",
        side.as_str(),
        action.as_str()
    );
    let digest = Sha256::digest(raw.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Entry and exit journal rows for each executed trade.
pub fn journal_rows_from_trades(trades: &[ExecutedTrade], strategy: &str) -> Vec<JournalRow> {
    let mut rows = Vec::with_capacity(trades.len() * 2);
    for executed in trades {
        let trade = &executed.trade;
        for (is_entry, time, price) in [
            (true, trade.entry_time, trade.entry_price),
            (false, trade.exit_time, trade.exit_price),
        ] {
            let action = JournalAction::for_side(trade.side, is_entry);
            rows.push(JournalRow {
                datetime: time,
                ticker: trade.ticker.clone(),
                side: trade.side,
                price,
                shares: trade.shares,
                commission: executed.commission,
                action,
                execution: compute_execution_id(
                    &trade.ticker,
                    strategy,
                    trade.trade_id,
                    time,
                    trade.side,
                    action,
                    trade.shares,
                    price,
                ),
                trade_id: trade.trade_id,
                exit_reason: (!is_entry).then(|| trade.exit_reason.clone()).flatten(),
            });
        }
    }
    rows
}

/// One journal row per PM-managed execution intent, with trade ids recovered
/// from the open/close sequence.
pub fn journal_rows_from_executions(
    intents: &[ExecutionIntent],
    strategy: &str,
) -> Vec<JournalRow> {
    let mut ordered: Vec<&ExecutionIntent> = intents.iter().collect();
    ordered.sort_by(|a, b| (&a.ticker, a.signal_time).cmp(&(&b.ticker, b.signal_time)));

    let mut trade_ids: FxHashMap<String, u32> = FxHashMap::default();
    let mut position_shares: FxHashMap<String, f64> = FxHashMap::default();
    let mut rows = Vec::with_capacity(ordered.len());

    for intent in ordered {
        if intent.shares <= 0.0 || !intent.price.is_finite() {
            continue;
        }
        let current = position_shares.entry(intent.ticker.clone()).or_insert(0.0);
        let is_entry = intent.action.is_entry();

        if !is_entry && *current <= 0.0 {
            continue;
        }
        if is_entry && *current <= 0.0 {
            *trade_ids.entry(intent.ticker.clone()).or_insert(0) += 1;
        }
        let trade_id = trade_ids.get(&intent.ticker).copied().unwrap_or(1);

        if is_entry {
            *current += intent.shares;
        } else {
            *current = (*current - intent.shares).max(0.0);
        }

        let action = JournalAction::for_side(intent.side, is_entry);
        rows.push(JournalRow {
            datetime: intent.signal_time,
            ticker: intent.ticker.clone(),
            side: intent.side,
            price: intent.price,
            shares: intent.shares,
            commission: 0.0,
            action,
            execution: compute_execution_id(
                &intent.ticker,
                strategy,
                Some(trade_id),
                intent.signal_time,
                intent.side,
                action,
                intent.shares,
                intent.price,
            ),
            trade_id: Some(trade_id),
            exit_reason: intent.reason.clone(),
        });
    }
    rows
}

/// Column-orient journal rows for the queue payload. Optional columns that
/// are empty across every row are dropped; per-row gaps become `""` for
/// strings and `0` for numerics.
pub fn journal_rows_to_time_series(rows: &[JournalRow]) -> TimeSeriesData {
    let mut data = TimeSeriesData {
        datetime: rows.iter().map(|r| r.datetime.timestamp_millis()).collect(),
        columns: BTreeMap::new(),
    };

    data.insert_column(
        "ticker",
        json!(rows.iter().map(|r| r.ticker.as_str()).collect::<Vec<_>>()),
    );
    data.insert_column(
        "side",
        json!(rows.iter().map(|r| r.side.as_str()).collect::<Vec<_>>()),
    );
    data.insert_column(
        "price",
        json!(rows
            .iter()
            .map(|r| sanitize(r.price))
            .collect::<Vec<f64>>()),
    );
    data.insert_column(
        "shares",
        json!(rows
            .iter()
            .map(|r| sanitize(r.shares))
            .collect::<Vec<f64>>()),
    );
    data.insert_column(
        "commission",
        json!(rows
            .iter()
            .map(|r| sanitize(r.commission))
            .collect::<Vec<f64>>()),
    );
    data.insert_column(
        "action",
        json!(rows.iter().map(|r| r.action.as_str()).collect::<Vec<_>>()),
    );
    data.insert_column(
        "execution",
        json!(rows.iter().map(|r| r.execution.as_str()).collect::<Vec<_>>()),
    );

    if rows.iter().any(|r| r.trade_id.is_some()) {
        data.insert_column(
            "trade_id",
            json!(rows
                .iter()
                .map(|r| f64::from(r.trade_id.unwrap_or(0)))
                .collect::<Vec<f64>>()),
        );
    }
    if rows.iter().any(|r| r.exit_reason.is_some()) {
        data.insert_column(
            "exit_reason",
            json!(rows
                .iter()
                .map(|r| r.exit_reason.as_deref().unwrap_or(""))
                .collect::<Vec<_>>()),
        );
    }

    data
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{IntentAction, SignalType, Trade};
    use crate::queue::MemoryBroker;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn executed_trade() -> ExecutedTrade {
        ExecutedTrade {
            trade: Trade {
                ticker: "AAPL".to_string(),
                entry_time: ts(5),
                exit_time: ts(10),
                entry_price: 100.0,
                exit_price: 105.0,
                shares: 100.0,
                side: Side::Long,
                gross_pnl: 500.0,
                gross_pnl_pct: 5.0,
                efficiency: 50.0,
                time_held_hours: 120.0,
                strategy: "demo".to_string(),
                exit_reason: Some("take_profit".to_string()),
                trade_id: Some(1),
            },
            commission: 1.0,
            net_pnl: 498.0,
        }
    }

    fn meta() -> ResultsMeta {
        ResultsMeta {
            strategy_name: "demo".to_string(),
            ticker: "AAPL".to_string(),
            backtest_id: Some("bt-1".to_string()),
            hash_id: Some("a1b2c3d4e5f60718".to_string()),
            strategy_params: None,
            database: Some("backtest-dev".to_string()),
            portfolio_stage: Some("phase1".to_string()),
        }
    }

    fn intent(day: u32, action: IntentAction, shares: f64, price: f64) -> ExecutionIntent {
        ExecutionIntent {
            ticker: "AAPL".to_string(),
            signal_time: ts(day),
            signal_type: if action.is_entry() {
                SignalType::Buy
            } else {
                SignalType::Sell
            },
            side: Side::Long,
            price,
            action,
            shares,
            reason: None,
        }
    }

    #[test]
    fn execution_id_is_deterministic_and_16_hex() {
        let a = compute_execution_id(
            "AAPL",
            "demo",
            Some(1),
            ts(5),
            Side::Long,
            JournalAction::BuyToOpen,
            100.0,
            100.0,
        );
        let b = compute_execution_id(
            "AAPL",
            "demo",
            Some(1),
            ts(5),
            Side::Long,
            JournalAction::BuyToOpen,
            100.0,
            100.0,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn execution_id_changes_with_inputs() {
        let base = compute_execution_id(
            "AAPL",
            "demo",
            Some(1),
            ts(5),
            Side::Long,
            JournalAction::BuyToOpen,
            100.0,
            100.0,
        );
        let other = compute_execution_id(
            "AAPL",
            "demo",
            Some(1),
            ts(5),
            Side::Long,
            JournalAction::BuyToOpen,
            100.0,
            100.01,
        );
        assert_ne!(base, other);
    }

    #[test]
    fn trade_produces_entry_and_exit_rows() {
        let rows = journal_rows_from_trades(&[executed_trade()], "demo");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, JournalAction::BuyToOpen);
        assert_eq!(rows[1].action, JournalAction::SellToClose);
        assert_eq!(rows[0].exit_reason, None);
        assert_eq!(rows[1].exit_reason.as_deref(), Some("take_profit"));
        assert_ne!(rows[0].execution, rows[1].execution);
    }

    #[test]
    fn execution_rows_assign_trade_ids_per_lifecycle() {
        let intents = vec![
            intent(1, IntentAction::Open, 100.0, 100.0),
            intent(2, IntentAction::ScaleIn, 50.0, 101.0),
            intent(3, IntentAction::Close, 150.0, 105.0),
            intent(4, IntentAction::Open, 100.0, 100.0),
        ];
        let rows = journal_rows_from_executions(&intents, "demo");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].trade_id, Some(1));
        assert_eq!(rows[1].trade_id, Some(1));
        assert_eq!(rows[2].trade_id, Some(1));
        assert_eq!(rows[3].trade_id, Some(2));
    }

    #[test]
    fn orphan_exit_execution_is_skipped() {
        let intents = vec![intent(1, IntentAction::Close, 100.0, 100.0)];
        let rows = journal_rows_from_executions(&intents, "demo");
        assert!(rows.is_empty());
    }

    #[test]
    fn time_series_drops_all_empty_optional_columns() {
        let mut executed = executed_trade();
        executed.trade.trade_id = None;
        executed.trade.exit_reason = None;
        let rows = journal_rows_from_trades(&[executed], "demo");
        let data = journal_rows_to_time_series(&rows);
        assert!(!data.columns.contains_key("trade_id"));
        assert!(!data.columns.contains_key("exit_reason"));
        assert!(data.columns.contains_key("price"));
    }

    #[test]
    fn time_series_fills_row_gaps() {
        let rows = journal_rows_from_trades(&[executed_trade()], "demo");
        let data = journal_rows_to_time_series(&rows);
        // Entry row has no exit reason; it becomes "".
        assert_eq!(
            data.columns["exit_reason"],
            json!(["", "take_profit"])
        );
        assert_eq!(data.datetime.len(), 2);
    }

    #[test]
    fn write_trades_enqueues_with_expected_item_id() {
        let broker = Arc::new(MemoryBroker::new());
        let writer = ResultsWriter::new(broker.clone());
        let executed = [executed_trade()];

        assert!(writer.write_trades(&TradesData::Executed(&executed), &meta()));
        let ids = broker.peek(BACKTEST_TRADES_QUEUE_NAME, 10);
        assert_eq!(ids, vec!["AAPL_demo_bt-1"]);

        let data = broker
            .get_data(BACKTEST_TRADES_QUEUE_NAME, "AAPL_demo_bt-1")
            .unwrap();
        assert_eq!(data["portfolio_stage"], json!("phase1"));
        assert_eq!(data["hash_id"], json!("a1b2c3d4e5f60718"));
    }

    #[test]
    fn write_trades_empty_is_success_noop() {
        let broker = Arc::new(MemoryBroker::new());
        let writer = ResultsWriter::new(broker.clone());
        assert!(writer.write_trades(&TradesData::Executed(&[]), &meta()));
        assert_eq!(broker.size(BACKTEST_TRADES_QUEUE_NAME), 0);
    }

    #[test]
    fn write_trades_invalid_meta_is_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let writer = ResultsWriter::new(broker.clone());
        let executed = [executed_trade()];
        let mut bad_meta = meta();
        bad_meta.ticker = "  ".to_string();
        assert!(!writer.write_trades(&TradesData::Executed(&executed), &bad_meta));
        assert_eq!(broker.size(BACKTEST_TRADES_QUEUE_NAME), 0);
    }

    #[test]
    fn write_trades_same_id_overwrites() {
        let broker = Arc::new(MemoryBroker::new());
        let writer = ResultsWriter::new(broker.clone());
        let executed = [executed_trade()];
        assert!(writer.write_trades(&TradesData::Executed(&executed), &meta()));
        assert!(writer.write_trades(&TradesData::Executed(&executed), &meta()));
        assert_eq!(broker.size(BACKTEST_TRADES_QUEUE_NAME), 1);
    }

    #[test]
    fn write_metrics_rounds_and_enqueues() {
        let broker = Arc::new(MemoryBroker::new());
        let writer = ResultsWriter::new(broker.clone());
        let metrics = BacktestMetrics {
            total_trades: 3,
            total_profit: 123.456,
            total_profit_pct: 1.2345,
            max_drawdown: -4.5678,
            sharpe_ratio: 1.23456,
            avg_efficiency: 55.555,
            avg_return_pct: 0.411,
            avg_time_held: 12.345,
            win_rate: 66.666,
        };
        assert!(writer.write_metrics(&metrics, &meta()));

        let data = broker
            .get_data(BACKTEST_METRICS_QUEUE_NAME, "AAPL_demo_bt-1_metrics")
            .unwrap();
        assert_eq!(data["data"]["total_profit"], json!([123.46]));
        assert_eq!(data["data"]["sharpe_ratio"], json!([1.2346]));
        assert_eq!(data["data"]["strategy"], json!(["demo"]));
        assert_eq!(data["data"]["hash_id"], json!(["a1b2c3d4e5f60718"]));
    }

    #[test]
    fn write_studies_drops_all_nan_columns() {
        let broker = Arc::new(MemoryBroker::new());
        let writer = ResultsWriter::new(broker.clone());
        let mut studies = StudySeries {
            times: vec![ts(1), ts(2)],
            columns: BTreeMap::new(),
        };
        studies
            .columns
            .insert("sma_20".to_string(), vec![f64::NAN, 101.0]);
        studies
            .columns
            .insert("sma_200".to_string(), vec![f64::NAN, f64::NAN]);

        assert!(writer.write_studies(&studies, &meta()));
        let data = broker
            .get_data(BACKTEST_STUDIES_QUEUE_NAME, "AAPL_demo_bt-1_studies")
            .unwrap();
        assert_eq!(data["data"]["sma_20"], json!([0.0, 101.0]));
        assert!(data["data"].get("sma_200").is_none());
    }

    #[test]
    fn write_studies_empty_is_success_noop() {
        let broker = Arc::new(MemoryBroker::new());
        let writer = ResultsWriter::new(broker.clone());
        assert!(writer.write_studies(&StudySeries::default(), &meta()));
        assert_eq!(broker.size(BACKTEST_STUDIES_QUEUE_NAME), 0);
    }
}
