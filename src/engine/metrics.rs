use super::types::{BacktestMetrics, Trade};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Aggregate performance metrics from matched trades.
///
/// Per-trade returns stand in for daily returns in the Sharpe calculation;
/// empty input yields all-zero metrics.
pub fn calculate_metrics(
    trades: &[Trade],
    capital_per_trade: f64,
    risk_free_rate: f64,
) -> BacktestMetrics {
    if trades.is_empty() {
        tracing::warn!("No trades to analyze");
        return BacktestMetrics::default();
    }

    let total_trades = trades.len();
    let total_profit: f64 = trades.iter().map(|t| t.gross_pnl).sum();
    let total_capital = total_trades as f64 * capital_per_trade;
    let total_profit_pct = if total_capital > 0.0 {
        total_profit / total_capital * 100.0
    } else {
        0.0
    };

    let max_drawdown = calculate_max_drawdown(trades, capital_per_trade);
    let sharpe_ratio = calculate_sharpe_ratio(trades, risk_free_rate);
    let avg_efficiency =
        trades.iter().map(|t| t.efficiency).sum::<f64>() / total_trades as f64;
    let avg_return_pct =
        trades.iter().map(|t| t.gross_pnl_pct).sum::<f64>() / total_trades as f64;
    let avg_time_held =
        trades.iter().map(|t| t.time_held_hours).sum::<f64>() / total_trades as f64;

    let winning = trades.iter().filter(|t| t.gross_pnl > 0.0).count();
    let win_rate = winning as f64 / total_trades as f64 * 100.0;

    let metrics = BacktestMetrics {
        total_trades,
        total_profit,
        total_profit_pct,
        max_drawdown,
        sharpe_ratio,
        avg_efficiency,
        avg_return_pct,
        avg_time_held,
        win_rate,
    };

    tracing::debug!(
        "Metrics calculated: {total_trades} trades, ${total_profit:.2} profit \
         ({total_profit_pct:.2}%), {max_drawdown:.2}% drawdown, {sharpe_ratio:.2} Sharpe, \
         {avg_efficiency:.1}% efficiency, {win_rate:.1}% win rate"
    );

    metrics
}

/// Worst peak-to-trough decline of `capital_per_trade + cumulative pnl`,
/// trades ordered by exit time. Reported as a (non-positive) percentage.
pub fn calculate_max_drawdown(trades: &[Trade], capital_per_trade: f64) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<&Trade> = trades.iter().collect();
    sorted.sort_by_key(|t| t.exit_time);

    let mut cumulative_pnl = 0.0;
    let mut running_max = f64::NEG_INFINITY;
    let mut max_drawdown = 0.0_f64;

    for trade in sorted {
        cumulative_pnl += trade.gross_pnl;
        let portfolio_value = capital_per_trade + cumulative_pnl;
        running_max = running_max.max(portfolio_value);
        if running_max > 0.0 {
            let drawdown = (portfolio_value - running_max) / running_max * 100.0;
            max_drawdown = max_drawdown.min(drawdown);
        }
    }

    max_drawdown
}

/// Annualized Sharpe ratio over per-trade returns; zero with fewer than two
/// trades or zero volatility.
pub fn calculate_sharpe_ratio(trades: &[Trade], risk_free_rate: f64) -> f64 {
    if trades.len() < 2 {
        return 0.0;
    }

    let daily_rf_rate = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let excess: Vec<f64> = trades
        .iter()
        .map(|t| t.gross_pnl_pct / 100.0 - daily_rf_rate)
        .collect();

    let mean = excess.iter().sum::<f64>() / excess.len() as f64;
    let variance = excess.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
        / (excess.len() - 1) as f64;
    let std = variance.sqrt();

    if std == 0.0 || !std.is_finite() {
        return 0.0;
    }

    let sharpe = mean / std * TRADING_DAYS_PER_YEAR.sqrt();
    if sharpe.is_finite() {
        sharpe
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Side;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn trade(exit_day: u32, gross_pnl: f64, pct: f64) -> Trade {
        Trade {
            ticker: "AAPL".to_string(),
            entry_time: ts(1),
            exit_time: ts(exit_day),
            entry_price: 100.0,
            exit_price: 100.0 + gross_pnl / 100.0,
            shares: 100.0,
            side: Side::Long,
            gross_pnl,
            gross_pnl_pct: pct,
            efficiency: 50.0,
            time_held_hours: 24.0 * f64::from(exit_day - 1),
            strategy: "demo".to_string(),
            exit_reason: None,
            trade_id: None,
        }
    }

    #[test]
    fn empty_trades_all_zero() {
        let m = calculate_metrics(&[], 10_000.0, 0.04);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.win_rate, 0.0);
    }

    #[test]
    fn single_trade_metrics() {
        let m = calculate_metrics(&[trade(5, 500.0, 5.0)], 10_000.0, 0.04);
        assert_eq!(m.total_trades, 1);
        assert!((m.total_profit - 500.0).abs() < 1e-9);
        assert!((m.total_profit_pct - 5.0).abs() < 1e-9);
        assert_eq!(m.sharpe_ratio, 0.0, "needs at least 2 trades");
        assert!((m.win_rate - 100.0).abs() < 1e-9);
        assert!((m.avg_time_held - 96.0).abs() < 1e-9);
    }

    #[test]
    fn win_rate_counts_only_positive_pnl() {
        let trades = vec![trade(2, 100.0, 1.0), trade(3, -50.0, -0.5), trade(4, 0.0, 0.0)];
        let m = calculate_metrics(&trades, 10_000.0, 0.0);
        assert!((m.win_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn max_drawdown_known_sequence() {
        // PnLs: +1000, -2000, +500 on 10k capital.
        // Values: 11000, 9000, 9500; peak 11000.
        // Worst drawdown: (9000 - 11000) / 11000 = -18.1818...%.
        let trades = vec![
            trade(2, 1_000.0, 10.0),
            trade(3, -2_000.0, -20.0),
            trade(4, 500.0, 5.0),
        ];
        let dd = calculate_max_drawdown(&trades, 10_000.0);
        assert!((dd - (-2_000.0 / 11_000.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn max_drawdown_sorts_by_exit_time() {
        // Same trades given out of order must produce the same drawdown.
        let ordered = vec![trade(2, 1_000.0, 10.0), trade(3, -2_000.0, -20.0)];
        let shuffled = vec![trade(3, -2_000.0, -20.0), trade(2, 1_000.0, 10.0)];
        assert_eq!(
            calculate_max_drawdown(&ordered, 10_000.0),
            calculate_max_drawdown(&shuffled, 10_000.0)
        );
    }

    #[test]
    fn max_drawdown_zero_for_monotonic_gains() {
        let trades = vec![trade(2, 100.0, 1.0), trade(3, 200.0, 2.0)];
        assert_eq!(calculate_max_drawdown(&trades, 10_000.0), 0.0);
    }

    #[test]
    fn sharpe_zero_for_single_trade() {
        assert_eq!(calculate_sharpe_ratio(&[trade(2, 100.0, 1.0)], 0.04), 0.0);
    }

    #[test]
    fn sharpe_zero_for_constant_returns() {
        let trades = vec![trade(2, 100.0, 1.0), trade(3, 100.0, 1.0)];
        assert_eq!(calculate_sharpe_ratio(&trades, 0.0), 0.0);
    }

    #[test]
    fn sharpe_known_value() {
        // Returns 1% and 3%, rf 0: mean 0.02, sample std = 0.014142...
        let trades = vec![trade(2, 100.0, 1.0), trade(3, 300.0, 3.0)];
        let sharpe = calculate_sharpe_ratio(&trades, 0.0);
        let mean: f64 = 0.02;
        let std = ((0.01_f64 - 0.02).powi(2) + (0.03_f64 - 0.02).powi(2)).sqrt();
        let expected = mean / std * 252.0_f64.sqrt();
        assert!((sharpe - expected).abs() < 1e-9);
    }

    #[test]
    fn sharpe_subtracts_risk_free_rate() {
        let trades = vec![trade(2, 100.0, 1.0), trade(3, 300.0, 3.0)];
        let with_rf = calculate_sharpe_ratio(&trades, 0.04);
        let without_rf = calculate_sharpe_ratio(&trades, 0.0);
        assert!(with_rf < without_rf);
    }
}
