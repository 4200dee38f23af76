use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// PnL sign multiplier: +1 for LONG, -1 for SHORT.
    pub fn multiplier(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Buy,
    Sell,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Buy => "buy",
            SignalType::Sell => "sell",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy-produced trading signal.
///
/// `fields` carries any extra numeric values the strategy attached (indicator
/// readouts and the like); filters address them by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub ticker: String,
    pub signal_time: DateTime<Utc>,
    pub signal_type: SignalType,
    pub price: f64,
    pub side: Side,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, f64>,
}

impl Signal {
    pub fn new(
        ticker: impl Into<String>,
        signal_time: DateTime<Utc>,
        signal_type: SignalType,
        price: f64,
        side: Side,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            signal_time,
            signal_type,
            price,
            side,
            fields: BTreeMap::new(),
        }
    }

    /// A buy opens a LONG and a sell opens a SHORT.
    pub fn is_entry(&self) -> bool {
        matches!(
            (self.side, self.signal_type),
            (Side::Long, SignalType::Buy) | (Side::Short, SignalType::Sell)
        )
    }

    pub fn is_exit(&self) -> bool {
        matches!(
            (self.side, self.signal_type),
            (Side::Long, SignalType::Sell) | (Side::Short, SignalType::Buy)
        )
    }

    /// Resolve a named numeric field. `price` always resolves to the signal
    /// price; anything else is looked up in the extra-field map.
    pub fn field(&self, name: &str) -> Option<f64> {
        if name == "price" {
            return Some(self.price);
        }
        self.fields.get(name).copied()
    }
}

/// Per-ticker position state, owned exclusively by the position manager
/// processing that ticker.
///
/// Invariant: `size == 0.0` iff `side.is_none()` iff `entry_price.is_none()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionState {
    pub size: f64,
    pub side: Option<Side>,
    pub entry_price: Option<f64>,
}

impl PositionState {
    pub fn is_flat(&self) -> bool {
        self.size <= 0.0
    }

    pub fn open(&mut self, side: Side, entry_price: f64) {
        self.size = 1.0;
        self.side = Some(side);
        self.entry_price = Some(entry_price);
    }

    pub fn clear(&mut self) {
        self.size = 0.0;
        self.side = None;
        self.entry_price = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    Open,
    ScaleIn,
    ScaleOut,
    Close,
}

impl IntentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentAction::Open => "open",
            IntentAction::ScaleIn => "scale_in",
            IntentAction::ScaleOut => "scale_out",
            IntentAction::Close => "close",
        }
    }

    pub fn is_entry(self) -> bool {
        matches!(self, IntentAction::Open | IntentAction::ScaleIn)
    }
}

/// A signal after position management: the original signal plus the state
/// transition it caused.
///
/// `units` is the position-size delta in normalized units (an entry is one
/// unit); the journal's sizing pass turns units into share counts.
#[derive(Debug, Clone)]
pub struct ManagedSignal {
    pub signal: Signal,
    pub action: IntentAction,
    pub units: f64,
    /// Set only on partial exits.
    pub fraction: Option<f64>,
    pub pm_generated: bool,
    pub pm_scale_in: bool,
    pub reason: Option<&'static str>,
}

/// A sized execution row, ready for journaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionIntent {
    pub ticker: String,
    pub signal_time: DateTime<Utc>,
    pub signal_type: SignalType,
    pub side: Side,
    pub price: f64,
    pub action: IntentAction,
    pub shares: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A matched round-trip trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub shares: f64,
    pub side: Side,
    pub gross_pnl: f64,
    pub gross_pnl_pct: f64,
    /// Fraction of the best achievable PnL captured, 0-100.
    pub efficiency: f64,
    pub time_held_hours: f64,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<u32>,
}

/// A trade after execution simulation (slippage, commission, fill delay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedTrade {
    #[serde(flatten)]
    pub trade: Trade,
    pub commission: f64,
    pub net_pnl: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalAction {
    BuyToOpen,
    SellToOpen,
    BuyToClose,
    SellToClose,
}

impl JournalAction {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalAction::BuyToOpen => "buy_to_open",
            JournalAction::SellToOpen => "sell_to_open",
            JournalAction::BuyToClose => "buy_to_close",
            JournalAction::SellToClose => "sell_to_close",
        }
    }

    pub fn for_side(side: Side, is_entry: bool) -> Self {
        match (side, is_entry) {
            (Side::Long, true) => JournalAction::BuyToOpen,
            (Side::Long, false) => JournalAction::SellToClose,
            (Side::Short, true) => JournalAction::SellToOpen,
            (Side::Short, false) => JournalAction::BuyToClose,
        }
    }
}

/// One side of a trade, the canonical unit written to the trades queue.
#[derive(Debug, Clone, Serialize)]
pub struct JournalRow {
    pub datetime: DateTime<Utc>,
    pub ticker: String,
    pub side: Side,
    pub price: f64,
    pub shares: f64,
    pub commission: f64,
    pub action: JournalAction,
    /// Deterministic 16-hex execution id.
    pub execution: String,
    pub trade_id: Option<u32>,
    pub exit_reason: Option<String>,
}

/// Aggregate performance metrics for one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub total_profit: f64,
    pub total_profit_pct: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub avg_efficiency: f64,
    pub avg_return_pct: f64,
    pub avg_time_held: f64,
    pub win_rate: f64,
}

impl Default for BacktestMetrics {
    fn default() -> Self {
        Self {
            total_trades: 0,
            total_profit: 0.0,
            total_profit_pct: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            avg_efficiency: 0.0,
            avg_return_pct: 0.0,
            avg_time_held: 0.0,
            win_rate: 0.0,
        }
    }
}

/// Execution cost model applied to matched trades.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExecutionConfig {
    #[garde(range(min = 0.0))]
    pub slippage_bps: f64,
    #[garde(range(min = 0.0))]
    pub commission_per_share: f64,
    #[garde(skip)]
    pub use_limit_orders: bool,
    #[garde(range(min = 0))]
    pub fill_delay_minutes: i64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 0.0,
            commission_per_share: 0.0,
            use_limit_orders: false,
            fill_delay_minutes: 0,
        }
    }
}

/// Walk-forward split parameters. Always present in the configuration hash so
/// that toggling the flag changes the hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalkForwardParams {
    pub walk_forward: bool,
    pub train_days: Option<u32>,
    pub test_days: Option<u32>,
    pub train_split: Option<f64>,
}

/// Share sizing policy for trade matching.
#[derive(Debug, Clone, Copy)]
pub enum ShareSizing {
    /// `floor(capital_per_trade / entry_price)` shares per trade.
    FixedCapital { capital_per_trade: f64 },
    /// `floor(account_value * trade_percentage / price)` shares, with the
    /// account value compounding after every closed trade.
    AccountValue {
        initial_account_value: f64,
        trade_percentage: f64,
    },
}

/// Study output (indicator series) attached to a backtest run.
#[derive(Debug, Clone, Default)]
pub struct StudySeries {
    pub times: Vec<DateTime<Utc>>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl StudySeries {
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn long_buy_is_entry() {
        let s = Signal::new("AAPL", ts(5), SignalType::Buy, 100.0, Side::Long);
        assert!(s.is_entry());
        assert!(!s.is_exit());
    }

    #[test]
    fn short_sell_is_entry() {
        let s = Signal::new("AAPL", ts(5), SignalType::Sell, 100.0, Side::Short);
        assert!(s.is_entry());
        assert!(!s.is_exit());
    }

    #[test]
    fn long_sell_is_exit() {
        let s = Signal::new("AAPL", ts(5), SignalType::Sell, 100.0, Side::Long);
        assert!(s.is_exit());
    }

    #[test]
    fn short_buy_is_exit() {
        let s = Signal::new("AAPL", ts(5), SignalType::Buy, 100.0, Side::Short);
        assert!(s.is_exit());
    }

    #[test]
    fn signal_field_resolves_price() {
        let s = Signal::new("AAPL", ts(5), SignalType::Buy, 101.5, Side::Long);
        assert_eq!(s.field("price"), Some(101.5));
    }

    #[test]
    fn signal_field_resolves_extras() {
        let mut s = Signal::new("AAPL", ts(5), SignalType::Buy, 101.5, Side::Long);
        s.fields.insert("sma_fast".to_string(), 99.0);
        assert_eq!(s.field("sma_fast"), Some(99.0));
        assert_eq!(s.field("missing"), None);
    }

    #[test]
    fn position_state_open_and_clear() {
        let mut p = PositionState::default();
        assert!(p.is_flat());
        p.open(Side::Long, 100.0);
        assert!(!p.is_flat());
        assert_eq!(p.side, Some(Side::Long));
        assert_eq!(p.entry_price, Some(100.0));
        p.clear();
        assert!(p.is_flat());
        assert_eq!(p.side, None);
        assert_eq!(p.entry_price, None);
    }

    #[test]
    fn journal_action_labels() {
        assert_eq!(
            JournalAction::for_side(Side::Long, true).as_str(),
            "buy_to_open"
        );
        assert_eq!(
            JournalAction::for_side(Side::Long, false).as_str(),
            "sell_to_close"
        );
        assert_eq!(
            JournalAction::for_side(Side::Short, true).as_str(),
            "sell_to_open"
        );
        assert_eq!(
            JournalAction::for_side(Side::Short, false).as_str(),
            "buy_to_close"
        );
    }

    #[test]
    fn execution_config_rejects_negative_slippage() {
        let cfg = ExecutionConfig {
            slippage_bps: -1.0,
            ..ExecutionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn execution_config_default_validates() {
        assert!(ExecutionConfig::default().validate().is_ok());
    }
}
