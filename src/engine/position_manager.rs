use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use super::rules::{PositionRulePipeline, RuleContext};
use super::types::{IntentAction, ManagedSignal, PositionState, Side, Signal, SignalType};
use crate::data::OhlcvFrame;

/// Per-ticker entry/exit state machine.
///
/// Consumes the strategy's signal stream and the ticker's bars in time order
/// and emits a merged stream of execution intents. Within a bar, drained
/// strategy signals come first, then a PM-synthesized exit, then a
/// PM-synthesized scale-in; across bars the output is strictly time ordered.
pub struct PositionManager {
    pipeline: PositionRulePipeline,
    positions: FxHashMap<String, PositionState>,
}

impl PositionManager {
    pub fn new(pipeline: PositionRulePipeline) -> Self {
        Self {
            pipeline,
            positions: FxHashMap::default(),
        }
    }

    /// Run the state machine over all tickers present in `signals` (or, with
    /// no signals at all, the tickers with bars). Tickers without OHLCV fall
    /// back to signals-only mode: the stateful entry/exit filter with no
    /// synthesized events.
    ///
    /// The token is only observed between bars; the per-bar work never
    /// blocks.
    pub fn apply(
        &mut self,
        signals: Vec<Signal>,
        ohlcv_by_ticker: &FxHashMap<String, OhlcvFrame>,
        cancel: &CancellationToken,
    ) -> Vec<ManagedSignal> {
        let mut by_ticker: FxHashMap<String, Vec<Signal>> = FxHashMap::default();
        let mut ticker_order: Vec<String> = Vec::new();
        for signal in signals {
            if !by_ticker.contains_key(&signal.ticker) {
                ticker_order.push(signal.ticker.clone());
            }
            by_ticker.entry(signal.ticker.clone()).or_default().push(signal);
        }
        if ticker_order.is_empty() {
            ticker_order = ohlcv_by_ticker.keys().cloned().collect();
            ticker_order.sort();
        }

        let mut out = Vec::new();
        for ticker in &ticker_order {
            if cancel.is_cancelled() {
                tracing::info!("Position manager cancelled before {ticker}");
                break;
            }
            let mut ticker_signals = by_ticker.remove(ticker).unwrap_or_default();
            ticker_signals.sort_by_key(|s| s.signal_time);

            match ohlcv_by_ticker.get(ticker) {
                Some(frame) if !frame.is_empty() => {
                    self.apply_with_bars(ticker, ticker_signals, frame, cancel, &mut out);
                }
                _ => self.apply_signals_only(ticker, ticker_signals, &mut out),
            }
        }

        out.sort_by(|a, b| {
            (&a.signal.ticker, a.signal.signal_time).cmp(&(&b.signal.ticker, b.signal.signal_time))
        });
        out
    }

    pub fn position(&self, ticker: &str) -> Option<&PositionState> {
        self.positions.get(ticker)
    }

    fn apply_with_bars(
        &mut self,
        ticker: &str,
        signals: Vec<Signal>,
        frame: &OhlcvFrame,
        cancel: &CancellationToken,
        out: &mut Vec<ManagedSignal>,
    ) {
        let mut sig_idx = 0;
        for bar_idx in 0..frame.len() {
            if cancel.is_cancelled() {
                tracing::info!("Position manager cancelled mid-ticker for {ticker}");
                return;
            }
            let bar_time = frame.times()[bar_idx];

            while sig_idx < signals.len() && signals[sig_idx].signal_time <= bar_time {
                let signal = signals[sig_idx].clone();
                sig_idx += 1;
                if let Some(emitted) = self.process_strategy_signal(ticker, signal, Some(frame)) {
                    out.push(emitted);
                }
            }

            if let Some(pm_exit) = self.maybe_generate_pm_exit(ticker, frame, bar_idx) {
                out.push(pm_exit);
            }
            if let Some(pm_entry) = self.maybe_generate_pm_scale_in(ticker, frame, bar_idx) {
                out.push(pm_entry);
            }
        }
    }

    fn apply_signals_only(
        &mut self,
        ticker: &str,
        signals: Vec<Signal>,
        out: &mut Vec<ManagedSignal>,
    ) {
        for signal in signals {
            if let Some(emitted) = self.process_strategy_signal(ticker, signal, None) {
                out.push(emitted);
            }
        }
    }

    fn process_strategy_signal(
        &mut self,
        ticker: &str,
        signal: Signal,
        frame: Option<&OhlcvFrame>,
    ) -> Option<ManagedSignal> {
        let Self {
            pipeline,
            positions,
        } = self;
        let position = positions.entry(ticker.to_string()).or_default();

        if signal.is_entry() {
            if !position.is_flat() {
                return None;
            }
            let ctx = RuleContext {
                signal: &signal,
                position,
                ohlcv: frame,
            };
            if !pipeline.decide_entry(&ctx) {
                return None;
            }
            let entry_price = signal.price;
            position.open(signal.side, entry_price);
            return Some(ManagedSignal {
                signal,
                action: IntentAction::Open,
                units: 1.0,
                fraction: None,
                pm_generated: false,
                pm_scale_in: false,
                reason: None,
            });
        }

        if signal.is_exit() {
            if position.is_flat() {
                return None;
            }
            let ctx = RuleContext {
                signal: &signal,
                position,
                ohlcv: frame,
            };
            // Rules size the exit; with no opinion, a strategy-driven exit
            // passes through as a full exit. Only synthesized exits need a
            // rule to fire.
            let (mut fraction, reason) = pipeline.decide_exit(&ctx);
            if fraction <= 0.0 {
                fraction = 1.0;
            }
            let (action, units) = Self::apply_exit(position, fraction);
            if position.is_flat() {
                pipeline.reset_for_ticker(ticker);
            }
            return Some(ManagedSignal {
                signal,
                action,
                units,
                fraction: (fraction < 1.0).then_some(fraction),
                pm_generated: false,
                pm_scale_in: false,
                reason,
            });
        }

        None
    }

    fn maybe_generate_pm_exit(
        &mut self,
        ticker: &str,
        frame: &OhlcvFrame,
        bar_idx: usize,
    ) -> Option<ManagedSignal> {
        let Self {
            pipeline,
            positions,
        } = self;
        let position = positions.entry(ticker.to_string()).or_default();
        let side = position.side?;
        if position.is_flat() || position.entry_price.is_none() {
            return None;
        }

        let bar_time = frame.times()[bar_idx];
        let close = frame.close()[bar_idx];
        let signal_type = match side {
            Side::Long => SignalType::Sell,
            Side::Short => SignalType::Buy,
        };
        let synthetic = Signal::new(ticker, bar_time, signal_type, close, side);

        // Rules see only the bar that triggered the evaluation.
        let bar_slice = frame.slice_range(bar_idx, bar_idx + 1);
        let ctx = RuleContext {
            signal: &synthetic,
            position,
            ohlcv: Some(&bar_slice),
        };
        let (fraction, reason) = pipeline.decide_exit(&ctx);
        if fraction <= 0.0 {
            return None;
        }

        let (action, units) = Self::apply_exit(position, fraction);
        if position.is_flat() {
            pipeline.reset_for_ticker(ticker);
        }
        Some(ManagedSignal {
            signal: synthetic,
            action,
            units,
            fraction: (fraction < 1.0).then_some(fraction),
            pm_generated: true,
            pm_scale_in: false,
            reason,
        })
    }

    fn maybe_generate_pm_scale_in(
        &mut self,
        ticker: &str,
        frame: &OhlcvFrame,
        bar_idx: usize,
    ) -> Option<ManagedSignal> {
        if !self.pipeline.allow_scale_in() {
            return None;
        }
        let Self {
            pipeline,
            positions,
        } = self;
        let position = positions.entry(ticker.to_string()).or_default();
        let side = position.side?;
        if position.is_flat() || position.entry_price.is_none() {
            return None;
        }

        let bar_time = frame.times()[bar_idx];
        let close = frame.close()[bar_idx];
        let signal_type = match side {
            Side::Long => SignalType::Buy,
            Side::Short => SignalType::Sell,
        };
        let synthetic = Signal::new(ticker, bar_time, signal_type, close, side);

        let bar_slice = frame.slice_range(bar_idx, bar_idx + 1);
        let ctx = RuleContext {
            signal: &synthetic,
            position,
            ohlcv: Some(&bar_slice),
        };
        if !pipeline.decide_entry(&ctx) {
            return None;
        }

        position.size += 1.0;
        Some(ManagedSignal {
            signal: synthetic,
            action: IntentAction::ScaleIn,
            units: 1.0,
            fraction: None,
            pm_generated: true,
            pm_scale_in: true,
            reason: None,
        })
    }

    /// Decrement the position by `fraction` units (clamped at flat) and
    /// report the transition. Restores the flat-state invariant when the
    /// position empties.
    fn apply_exit(position: &mut PositionState, fraction: f64) -> (IntentAction, f64) {
        let before = position.size;
        position.size = (position.size - fraction).max(0.0);
        let units = before - position.size;
        if position.size <= 0.0 {
            position.clear();
            (IntentAction::Close, units)
        } else {
            (IntentAction::ScaleOut, units)
        }
    }
}
