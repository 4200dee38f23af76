use chrono::Duration;
use rustc_hash::FxHashMap;

use super::types::{ExecutedTrade, ExecutionConfig, Side, Trade};
use crate::data::OhlcvFrame;

/// Applies the execution cost model to matched trades: slippage, per-side
/// commission, and an optional fill delay that re-reads prices from the next
/// available bar.
pub struct ExecutionSimulator {
    config: ExecutionConfig,
}

impl ExecutionSimulator {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run every trade through the cost model. Trades whose delayed fill has
    /// no bar to price against are dropped.
    pub fn apply_execution(
        &self,
        trades: Vec<Trade>,
        data_cache: &FxHashMap<String, OhlcvFrame>,
    ) -> Vec<ExecutedTrade> {
        let mut executed = Vec::with_capacity(trades.len());
        for trade in trades {
            match self.execute_trade(trade, data_cache) {
                Some(t) => executed.push(t),
                None => tracing::debug!("Dropped trade with no fill bar after delay"),
            }
        }
        executed
    }

    fn execute_trade(
        &self,
        mut trade: Trade,
        data_cache: &FxHashMap<String, OhlcvFrame>,
    ) -> Option<ExecutedTrade> {
        // Fill delay first: prices move to the open of the first bar at or
        // after signal_time + delay.
        if self.config.fill_delay_minutes > 0 {
            let frame = data_cache.get(&trade.ticker)?;
            let delay = Duration::minutes(self.config.fill_delay_minutes);
            trade.entry_price = delayed_fill_price(frame, trade.entry_time + delay)?;
            trade.exit_price = delayed_fill_price(frame, trade.exit_time + delay)?;
        }

        // Slippage widens the fill against the trade direction on each side.
        let slip = self.config.slippage_bps / 10_000.0;
        match trade.side {
            Side::Long => {
                trade.entry_price *= 1.0 + slip;
                trade.exit_price *= 1.0 - slip;
            }
            Side::Short => {
                trade.entry_price *= 1.0 - slip;
                trade.exit_price *= 1.0 + slip;
            }
        }

        trade.gross_pnl =
            trade.shares * (trade.exit_price - trade.entry_price) * trade.side.multiplier();
        let capital_at_entry = trade.shares * trade.entry_price;
        trade.gross_pnl_pct = if capital_at_entry > 0.0 {
            trade.gross_pnl / capital_at_entry * 100.0
        } else {
            0.0
        };

        let commission = self.config.commission_per_share * trade.shares;
        let net_pnl = trade.gross_pnl - 2.0 * commission;

        Some(ExecutedTrade {
            trade,
            commission,
            net_pnl,
        })
    }
}

fn delayed_fill_price(frame: &OhlcvFrame, at_or_after: chrono::DateTime<chrono::Utc>) -> Option<f64> {
    let idx = frame.first_bar_at_or_after(at_or_after)?;
    Some(frame.open()[idx])
}
