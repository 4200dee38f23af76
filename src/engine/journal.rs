use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

use super::types::{
    ExecutionIntent, IntentAction, ManagedSignal, ShareSizing, Side, Signal, Trade,
};
use crate::data::OhlcvFrame;

/// Match signals into round-trip trades, FIFO per ticker.
///
/// An exit pops the oldest open entry for its ticker regardless of side and
/// the trade inherits the entry's side. That mixed-side pairing is historical
/// behavior kept for compatibility; a future revision should segregate the
/// queues per side.
pub fn match_trades_fifo(
    signals: &[Signal],
    strategy_name: &str,
    sizing: ShareSizing,
    ohlcv_data: Option<&OhlcvFrame>,
) -> Vec<Trade> {
    if signals.is_empty() {
        tracing::warn!("No signals to match");
        return Vec::new();
    }

    let mut ordered: Vec<&Signal> = signals.iter().collect();
    ordered.sort_by(|a, b| (&a.ticker, a.signal_time).cmp(&(&b.ticker, b.signal_time)));

    struct OpenEntry {
        entry_time: DateTime<Utc>,
        entry_price: f64,
        side: Side,
    }

    let mut open_positions: FxHashMap<String, VecDeque<OpenEntry>> = FxHashMap::default();
    let mut account_value = match sizing {
        ShareSizing::AccountValue {
            initial_account_value,
            ..
        } => initial_account_value,
        ShareSizing::FixedCapital { .. } => 0.0,
    };
    let mut matched = Vec::new();

    for signal in ordered {
        let queue = open_positions.entry(signal.ticker.clone()).or_default();

        if signal.is_entry() {
            queue.push_back(OpenEntry {
                entry_time: signal.signal_time,
                entry_price: signal.price,
                side: signal.side,
            });
        } else if signal.is_exit() {
            let Some(entry) = queue.pop_front() else {
                continue;
            };
            let exit_price = signal.price;
            let shares = match sizing {
                ShareSizing::FixedCapital { capital_per_trade } => {
                    shares_for(capital_per_trade, entry.entry_price)
                }
                ShareSizing::AccountValue {
                    trade_percentage, ..
                } => shares_for(account_value * trade_percentage, exit_price),
            };

            let gross_pnl = shares * (exit_price - entry.entry_price) * entry.side.multiplier();
            let capital_at_entry = shares * entry.entry_price;
            let gross_pnl_pct = if capital_at_entry > 0.0 {
                gross_pnl / capital_at_entry * 100.0
            } else {
                0.0
            };
            if let ShareSizing::AccountValue { .. } = sizing {
                account_value += gross_pnl;
            }

            let efficiency = calculate_efficiency(
                entry.entry_time,
                signal.signal_time,
                entry.entry_price,
                exit_price,
                ohlcv_data,
            );

            matched.push(Trade {
                ticker: signal.ticker.clone(),
                entry_time: entry.entry_time,
                exit_time: signal.signal_time,
                entry_price: entry.entry_price,
                exit_price,
                shares,
                side: entry.side,
                gross_pnl,
                gross_pnl_pct,
                efficiency,
                time_held_hours: hours_between(entry.entry_time, signal.signal_time),
                strategy: strategy_name.to_string(),
                exit_reason: None,
                trade_id: None,
            });
        }
    }

    let unmatched: usize = open_positions.values().map(VecDeque::len).sum();
    if unmatched > 0 {
        tracing::debug!("{unmatched} open positions remain unmatched");
    }
    if matched.is_empty() {
        tracing::warn!("No trades could be matched");
    } else {
        tracing::debug!("Matched {} completed trades", matched.len());
    }
    matched
}

/// Turn position-manager output into sized execution intents.
///
/// Entries are sized one unit at a time (`floor(capital / price)` shares, or
/// the account-value variant); exits convert their unit delta back to shares
/// pro rata against the open lot, with a full close flushing the remainder so
/// rounding never strands shares.
pub fn size_executions(
    managed: &[ManagedSignal],
    sizing: ShareSizing,
) -> Vec<ExecutionIntent> {
    struct OpenLot {
        open_shares: f64,
        open_units: f64,
        avg_entry_price: f64,
        side: Side,
    }

    let mut lots: FxHashMap<String, OpenLot> = FxHashMap::default();
    let mut account_value = match sizing {
        ShareSizing::AccountValue {
            initial_account_value,
            ..
        } => initial_account_value,
        ShareSizing::FixedCapital { .. } => 0.0,
    };
    let mut intents = Vec::with_capacity(managed.len());

    for row in managed {
        let ticker = &row.signal.ticker;
        let price = row.signal.price;

        let shares = match row.action {
            IntentAction::Open | IntentAction::ScaleIn => {
                let per_unit = match sizing {
                    ShareSizing::FixedCapital { capital_per_trade } => {
                        shares_for(capital_per_trade, price)
                    }
                    ShareSizing::AccountValue {
                        trade_percentage, ..
                    } => shares_for(account_value * trade_percentage, price),
                };
                let added = per_unit * row.units;
                let lot = lots.entry(ticker.clone()).or_insert(OpenLot {
                    open_shares: 0.0,
                    open_units: 0.0,
                    avg_entry_price: price,
                    side: row.signal.side,
                });
                let total = lot.open_shares + added;
                if total > 0.0 {
                    lot.avg_entry_price =
                        (lot.avg_entry_price * lot.open_shares + price * added) / total;
                }
                lot.open_shares = total;
                lot.open_units += row.units;
                added
            }
            IntentAction::ScaleOut | IntentAction::Close => {
                let Some(lot) = lots.get_mut(ticker) else {
                    continue;
                };
                let shares = if row.action == IntentAction::Close || row.units >= lot.open_units {
                    lot.open_shares
                } else {
                    lot.open_shares * (row.units / lot.open_units)
                };
                lot.open_shares -= shares;
                lot.open_units = (lot.open_units - row.units).max(0.0);
                if let ShareSizing::AccountValue { .. } = sizing {
                    // Realize PnL so later entries size against the
                    // compounded account.
                    account_value +=
                        shares * (price - lot.avg_entry_price) * lot.side.multiplier();
                }
                if row.action == IntentAction::Close {
                    lots.remove(ticker);
                }
                shares
            }
        };

        if shares <= 0.0 {
            continue;
        }

        intents.push(ExecutionIntent {
            ticker: ticker.clone(),
            signal_time: row.signal.signal_time,
            signal_type: row.signal.signal_type,
            side: row.signal.side,
            price,
            action: row.action,
            shares,
            reason: row.reason.map(str::to_string),
        });
    }

    intents
}

/// Pair sized execution intents into trades for metrics and simulation.
///
/// Each open-position lifecycle gets one trade id; scale-ins blend into a
/// volume-weighted entry price, and every scale-out/close emits a trade
/// closing that many shares against the blended entry.
pub fn trades_from_executions(
    intents: &[ExecutionIntent],
    strategy_name: &str,
    ohlcv_data: Option<&OhlcvFrame>,
) -> Vec<Trade> {
    struct Lifecycle {
        trade_id: u32,
        entry_time: DateTime<Utc>,
        avg_entry_price: f64,
        open_shares: f64,
        side: Side,
    }

    let mut next_trade_id: FxHashMap<String, u32> = FxHashMap::default();
    let mut open: FxHashMap<String, Lifecycle> = FxHashMap::default();
    let mut trades = Vec::new();

    for intent in intents {
        let ticker = &intent.ticker;
        match intent.action {
            IntentAction::Open | IntentAction::ScaleIn => {
                if let Some(lifecycle) = open.get_mut(ticker) {
                    let total = lifecycle.open_shares + intent.shares;
                    if total > 0.0 {
                        lifecycle.avg_entry_price = (lifecycle.avg_entry_price
                            * lifecycle.open_shares
                            + intent.price * intent.shares)
                            / total;
                    }
                    lifecycle.open_shares = total;
                } else {
                    let id = next_trade_id.entry(ticker.clone()).or_insert(0);
                    *id += 1;
                    open.insert(
                        ticker.clone(),
                        Lifecycle {
                            trade_id: *id,
                            entry_time: intent.signal_time,
                            avg_entry_price: intent.price,
                            open_shares: intent.shares,
                            side: intent.side,
                        },
                    );
                }
            }
            IntentAction::ScaleOut | IntentAction::Close => {
                let Some(lifecycle) = open.get_mut(ticker) else {
                    continue;
                };
                let shares = intent.shares.min(lifecycle.open_shares);
                if shares <= 0.0 {
                    continue;
                }
                let gross_pnl =
                    shares * (intent.price - lifecycle.avg_entry_price) * lifecycle.side.multiplier();
                let capital_at_entry = shares * lifecycle.avg_entry_price;
                let gross_pnl_pct = if capital_at_entry > 0.0 {
                    gross_pnl / capital_at_entry * 100.0
                } else {
                    0.0
                };
                trades.push(Trade {
                    ticker: ticker.clone(),
                    entry_time: lifecycle.entry_time,
                    exit_time: intent.signal_time,
                    entry_price: lifecycle.avg_entry_price,
                    exit_price: intent.price,
                    shares,
                    side: lifecycle.side,
                    gross_pnl,
                    gross_pnl_pct,
                    efficiency: calculate_efficiency(
                        lifecycle.entry_time,
                        intent.signal_time,
                        lifecycle.avg_entry_price,
                        intent.price,
                        ohlcv_data,
                    ),
                    time_held_hours: hours_between(lifecycle.entry_time, intent.signal_time),
                    strategy: strategy_name.to_string(),
                    exit_reason: intent.reason.clone(),
                    trade_id: Some(lifecycle.trade_id),
                });

                lifecycle.open_shares -= shares;
                if intent.action == IntentAction::Close || lifecycle.open_shares <= 0.0 {
                    open.remove(ticker);
                }
            }
        }
    }

    trades
}

/// Fraction of the best achievable PnL the trade captured, clipped to
/// [0, 100]. Zero when OHLCV is missing, the hold window has no bars, or the
/// peak never rose above the entry.
pub fn calculate_efficiency(
    entry_time: DateTime<Utc>,
    exit_time: DateTime<Utc>,
    entry_price: f64,
    exit_price: f64,
    ohlcv_data: Option<&OhlcvFrame>,
) -> f64 {
    let Some(frame) = ohlcv_data else {
        return 0.0;
    };
    let held = frame.between(entry_time, exit_time);
    if held.is_empty() {
        return 0.0;
    }

    let actual_pnl = exit_price - entry_price;
    let max_price = held.high().iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let potential_pnl = max_price - entry_price;
    if potential_pnl <= 0.0 {
        return 0.0;
    }

    (actual_pnl / potential_pnl * 100.0).clamp(0.0, 100.0)
}

fn shares_for(capital: f64, price: f64) -> f64 {
    if price <= 0.0 || capital <= 0.0 {
        return 0.0;
    }
    (capital / price).floor()
}

fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_seconds() as f64 / 3600.0
}
