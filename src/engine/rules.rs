use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};

use super::types::{PositionState, Side, Signal};
use crate::config::{AnchorParams, AnchorType, PositionManagerConfig, PositionRuleSpec};
use crate::data::OhlcvFrame;

pub const REASON_TAKE_PROFIT: &str = "take_profit";
pub const REASON_STOP_LOSS: &str = "stop_loss";

/// What a rule wants: an entry veto, an exit fraction, or nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionDecision {
    pub allow_entry: Option<bool>,
    pub exit_fraction: Option<f64>,
    pub reason: Option<&'static str>,
}

/// Read-only view a rule evaluates against. `ohlcv` holds the bars visible to
/// the rule at this evaluation point (for PM-synthesized signals, the current
/// bar only).
pub struct RuleContext<'a> {
    pub signal: &'a Signal,
    pub position: &'a PositionState,
    pub ohlcv: Option<&'a OhlcvFrame>,
}

/// Anchor the TP/SL distance is measured from.
#[derive(Debug, Clone)]
pub struct AnchorConfig {
    pub anchor_type: AnchorType,
    pub anchor_field: String,
    pub lookback_bars: Option<usize>,
}

impl AnchorConfig {
    fn from_params(params: Option<&AnchorParams>, field_price: &str) -> Self {
        let params = params.cloned().unwrap_or_default();
        Self {
            anchor_type: params.anchor_type,
            anchor_field: params.field.unwrap_or_else(|| field_price.to_string()),
            lookback_bars: params.lookback_bars,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScalingRule {
    pub allow_scale_in: bool,
    pub allow_scale_out: bool,
}

#[derive(Debug, Clone)]
pub struct TakeProfitRule {
    pub field_price: String,
    pub target_pct: f64,
    pub fraction: f64,
    pub anchor: AnchorConfig,
    pub one_shot: bool,
}

#[derive(Debug, Clone)]
pub struct StopLossRule {
    pub field_price: String,
    pub loss_pct: f64,
    pub fraction: f64,
    pub anchor: AnchorConfig,
    pub one_shot: bool,
}

/// Closed set of position rules; dispatch is by variant.
#[derive(Debug, Clone)]
pub enum PositionRule {
    Scaling(ScalingRule),
    TakeProfit(TakeProfitRule),
    StopLoss(StopLossRule),
}

impl PositionRule {
    pub fn name(&self) -> &'static str {
        match self {
            PositionRule::Scaling(_) => "scaling",
            PositionRule::TakeProfit(_) => "take_profit",
            PositionRule::StopLoss(_) => "stop_loss",
        }
    }

    pub fn one_shot(&self) -> bool {
        match self {
            PositionRule::Scaling(_) => false,
            PositionRule::TakeProfit(r) => r.one_shot,
            PositionRule::StopLoss(r) => r.one_shot,
        }
    }

    /// `Err` is treated by the pipeline as an entry veto / exit no-op.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<PositionDecision> {
        match self {
            PositionRule::Scaling(rule) => Ok(evaluate_scaling(rule, ctx)),
            PositionRule::TakeProfit(rule) => Ok(evaluate_take_profit(rule, ctx)),
            PositionRule::StopLoss(rule) => Ok(evaluate_stop_loss(rule, ctx)),
        }
    }
}

fn evaluate_scaling(rule: &ScalingRule, ctx: &RuleContext<'_>) -> PositionDecision {
    if ctx.signal.is_entry() && ctx.position.size > 0.0 && !rule.allow_scale_in {
        return PositionDecision {
            allow_entry: Some(false),
            ..PositionDecision::default()
        };
    }
    PositionDecision::default()
}

fn evaluate_take_profit(rule: &TakeProfitRule, ctx: &RuleContext<'_>) -> PositionDecision {
    let Some(current) = exit_signal_price(ctx, &rule.field_price) else {
        return PositionDecision::default();
    };
    let Some(anchor) = compute_anchor_price(ctx, &rule.anchor) else {
        return PositionDecision::default();
    };
    if anchor <= 0.0 {
        return PositionDecision::default();
    }

    let mut pnl_pct = (current - anchor) / anchor;
    if ctx.position.side == Some(Side::Short) {
        pnl_pct = -pnl_pct;
    }

    if pnl_pct >= rule.target_pct {
        return PositionDecision {
            exit_fraction: Some(rule.fraction),
            reason: Some(REASON_TAKE_PROFIT),
            ..PositionDecision::default()
        };
    }
    PositionDecision::default()
}

fn evaluate_stop_loss(rule: &StopLossRule, ctx: &RuleContext<'_>) -> PositionDecision {
    let Some(current) = exit_signal_price(ctx, &rule.field_price) else {
        return PositionDecision::default();
    };
    let Some(anchor) = compute_anchor_price(ctx, &rule.anchor) else {
        return PositionDecision::default();
    };
    if anchor <= 0.0 {
        return PositionDecision::default();
    }

    let mut pnl_pct = (current - anchor) / anchor;
    if ctx.position.side == Some(Side::Short) {
        pnl_pct = -pnl_pct;
    }

    if pnl_pct <= -rule.loss_pct {
        return PositionDecision {
            exit_fraction: Some(rule.fraction),
            reason: Some(REASON_STOP_LOSS),
            ..PositionDecision::default()
        };
    }
    PositionDecision::default()
}

/// Current price for an exit-direction signal against an open position, or
/// `None` when the rule has nothing to say.
fn exit_signal_price(ctx: &RuleContext<'_>, field_price: &str) -> Option<f64> {
    if ctx.position.size <= 0.0 || ctx.position.entry_price.is_none() {
        return None;
    }
    let is_exit = match ctx.position.side {
        Some(Side::Long) => ctx.signal.signal_type == super::types::SignalType::Sell,
        Some(Side::Short) => ctx.signal.signal_type == super::types::SignalType::Buy,
        None => false,
    };
    if !is_exit {
        return None;
    }
    ctx.signal.field(field_price).filter(|p| p.is_finite())
}

/// Anchor price per configuration. Missing data, a missing field, or an empty
/// slice all yield `None`, which mutes the rule.
fn compute_anchor_price(ctx: &RuleContext<'_>, anchor: &AnchorConfig) -> Option<f64> {
    if anchor.anchor_type == AnchorType::EntryPrice {
        return ctx.position.entry_price;
    }

    let frame = ctx.ohlcv?;
    if frame.is_empty() {
        return None;
    }

    let upto = frame.bars_through(ctx.signal.signal_time);
    if upto == 0 {
        return None;
    }
    let start = match anchor.lookback_bars {
        Some(lookback) if lookback > 0 => upto.saturating_sub(lookback),
        _ => 0,
    };

    let column = frame.column(&anchor.anchor_field)?;
    let window = &column[start..upto];
    match anchor.anchor_type {
        AnchorType::RollingMax => window.iter().copied().reduce(f64::max),
        AnchorType::RollingMin => window.iter().copied().reduce(f64::min),
        AnchorType::EntryPrice => ctx.position.entry_price,
    }
}

/// Ordered rule pipeline with per-ticker one-shot bookkeeping.
pub struct PositionRulePipeline {
    rules: Vec<PositionRule>,
    /// One-shot rules that already fired this open-position lifecycle,
    /// keyed by ticker.
    fired: FxHashMap<String, FxHashSet<usize>>,
}

impl PositionRulePipeline {
    pub fn new(rules: Vec<PositionRule>) -> Self {
        Self {
            rules,
            fired: FxHashMap::default(),
        }
    }

    pub fn from_config(config: &PositionManagerConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|spec| match spec {
                PositionRuleSpec::Scaling(p) => PositionRule::Scaling(ScalingRule {
                    allow_scale_in: p.allow_scale_in,
                    allow_scale_out: p.allow_scale_out,
                }),
                PositionRuleSpec::TakeProfit(p) => PositionRule::TakeProfit(TakeProfitRule {
                    field_price: p.field_price.clone(),
                    target_pct: p.target_pct,
                    fraction: p.fraction,
                    anchor: AnchorConfig::from_params(p.anchor.as_ref(), &p.field_price),
                    one_shot: p.one_shot,
                }),
                PositionRuleSpec::StopLoss(p) => PositionRule::StopLoss(StopLossRule {
                    field_price: p.field_price.clone(),
                    loss_pct: p.loss_pct,
                    fraction: p.fraction,
                    anchor: AnchorConfig::from_params(p.anchor.as_ref(), &p.field_price),
                    one_shot: p.one_shot,
                }),
            })
            .collect();
        Self::new(rules)
    }

    pub fn allow_scale_in(&self) -> bool {
        self.rules
            .iter()
            .find_map(|r| match r {
                PositionRule::Scaling(s) => Some(s.allow_scale_in),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn allow_scale_out(&self) -> bool {
        self.rules
            .iter()
            .find_map(|r| match r {
                PositionRule::Scaling(s) => Some(s.allow_scale_out),
                _ => None,
            })
            .unwrap_or(true)
    }

    /// Entry requires unanimity: any veto or rule error blocks it.
    pub fn decide_entry(&self, ctx: &RuleContext<'_>) -> bool {
        for rule in &self.rules {
            match rule.evaluate(ctx) {
                Ok(decision) => {
                    if decision.allow_entry == Some(false) {
                        tracing::debug!(
                            "Rule {} rejected entry for {} at {}",
                            rule.name(),
                            ctx.signal.ticker,
                            ctx.signal.signal_time
                        );
                        return false;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Rule {} raised error for {} at {}: {e}",
                        rule.name(),
                        ctx.signal.ticker,
                        ctx.signal.signal_time
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Largest exit fraction across rules, with the reason of the rule that
    /// contributed it (first wins on ties). Fractions are clamped to [0, 1];
    /// with scale-out disallowed, any positive fraction becomes a full exit.
    pub fn decide_exit(&mut self, ctx: &RuleContext<'_>) -> (f64, Option<&'static str>) {
        let allow_scale_out = self.allow_scale_out();
        let mut max_fraction = 0.0_f64;
        let mut chosen_reason = None;

        let Self { rules, fired } = self;
        let fired_for_ticker = fired.entry(ctx.signal.ticker.clone()).or_default();

        for (idx, rule) in rules.iter().enumerate() {
            let is_one_shot = rule.one_shot();
            if is_one_shot && fired_for_ticker.contains(&idx) {
                continue;
            }

            match rule.evaluate(ctx) {
                Ok(decision) => {
                    if let Some(fraction) = decision.exit_fraction {
                        if fraction > 0.0 {
                            if fraction > max_fraction {
                                max_fraction = fraction;
                                chosen_reason = decision.reason;
                            }
                            if is_one_shot {
                                fired_for_ticker.insert(idx);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Rule {} raised error for {} at {}: {e}",
                        rule.name(),
                        ctx.signal.ticker,
                        ctx.signal.signal_time
                    );
                }
            }
        }

        if !allow_scale_out && max_fraction > 0.0 {
            return (1.0, chosen_reason);
        }
        (max_fraction.clamp(0.0, 1.0), chosen_reason)
    }

    /// Clear one-shot state for a ticker when its position goes flat.
    pub fn reset_for_ticker(&mut self, ticker: &str) {
        self.fired.remove(ticker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sample_frame;
    use crate::engine::types::SignalType;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn exit_signal(price: f64, day: u32) -> Signal {
        Signal::new("AAPL", ts(day), SignalType::Sell, price, Side::Long)
    }

    fn open_long(entry_price: f64) -> PositionState {
        let mut p = PositionState::default();
        p.open(Side::Long, entry_price);
        p
    }

    fn tp_rule(target_pct: f64, fraction: f64, one_shot: bool) -> PositionRule {
        PositionRule::TakeProfit(TakeProfitRule {
            field_price: "price".to_string(),
            target_pct,
            fraction,
            anchor: AnchorConfig {
                anchor_type: AnchorType::EntryPrice,
                anchor_field: "price".to_string(),
                lookback_bars: None,
            },
            one_shot,
        })
    }

    fn sl_rule(loss_pct: f64, fraction: f64) -> PositionRule {
        PositionRule::StopLoss(StopLossRule {
            field_price: "price".to_string(),
            loss_pct,
            fraction,
            anchor: AnchorConfig {
                anchor_type: AnchorType::EntryPrice,
                anchor_field: "price".to_string(),
                lookback_bars: None,
            },
            one_shot: true,
        })
    }

    #[test]
    fn take_profit_fires_at_target() {
        let mut pipeline = PositionRulePipeline::new(vec![tp_rule(0.05, 0.5, true)]);
        let position = open_long(100.0);
        let signal = exit_signal(106.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        let (fraction, reason) = pipeline.decide_exit(&ctx);
        assert_eq!(fraction, 0.5);
        assert_eq!(reason, Some(REASON_TAKE_PROFIT));
    }

    #[test]
    fn take_profit_quiet_below_target() {
        let mut pipeline = PositionRulePipeline::new(vec![tp_rule(0.05, 0.5, true)]);
        let position = open_long(100.0);
        let signal = exit_signal(104.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx), (0.0, None));
    }

    #[test]
    fn stop_loss_fires_on_drawdown() {
        let mut pipeline = PositionRulePipeline::new(vec![sl_rule(0.05, 1.0)]);
        let position = open_long(100.0);
        let signal = exit_signal(94.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        let (fraction, reason) = pipeline.decide_exit(&ctx);
        assert_eq!(fraction, 1.0);
        assert_eq!(reason, Some(REASON_STOP_LOSS));
    }

    #[test]
    fn short_side_flips_the_sign() {
        let mut pipeline = PositionRulePipeline::new(vec![tp_rule(0.05, 1.0, false)]);
        let mut position = PositionState::default();
        position.open(Side::Short, 100.0);
        // Short profits when price falls.
        let signal = Signal::new("AAPL", ts(10), SignalType::Buy, 94.0, Side::Short);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        let (fraction, _) = pipeline.decide_exit(&ctx);
        assert_eq!(fraction, 1.0);
    }

    #[test]
    fn exit_ignored_when_flat() {
        let mut pipeline = PositionRulePipeline::new(vec![tp_rule(0.05, 1.0, false)]);
        let position = PositionState::default();
        let signal = exit_signal(200.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx), (0.0, None));
    }

    #[test]
    fn one_shot_fires_once_until_reset() {
        let mut pipeline = PositionRulePipeline::new(vec![tp_rule(0.05, 0.5, true)]);
        let position = open_long(100.0);
        let signal = exit_signal(110.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx).0, 0.5);
        assert_eq!(pipeline.decide_exit(&ctx).0, 0.0);

        pipeline.reset_for_ticker("AAPL");
        assert_eq!(pipeline.decide_exit(&ctx).0, 0.5);
    }

    #[test]
    fn one_shot_state_is_per_ticker() {
        let mut pipeline = PositionRulePipeline::new(vec![tp_rule(0.05, 0.5, true)]);
        let position = open_long(100.0);
        let aapl = exit_signal(110.0, 10);
        let msft = Signal::new("MSFT", ts(10), SignalType::Sell, 110.0, Side::Long);

        let ctx = RuleContext {
            signal: &aapl,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx).0, 0.5);

        let ctx = RuleContext {
            signal: &msft,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx).0, 0.5);
    }

    #[test]
    fn max_fraction_wins_with_its_reason() {
        let mut pipeline =
            PositionRulePipeline::new(vec![tp_rule(0.05, 0.25, false), sl_rule(0.05, 1.0)]);
        let position = open_long(100.0);
        // Deep drawdown: SL fraction 1.0 beats TP 0.25 (TP won't fire here).
        let signal = exit_signal(90.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        let (fraction, reason) = pipeline.decide_exit(&ctx);
        assert_eq!(fraction, 1.0);
        assert_eq!(reason, Some(REASON_STOP_LOSS));
    }

    #[test]
    fn scale_out_disabled_promotes_to_full_exit() {
        let mut pipeline = PositionRulePipeline::new(vec![
            PositionRule::Scaling(ScalingRule {
                allow_scale_in: false,
                allow_scale_out: false,
            }),
            tp_rule(0.05, 0.5, false),
        ]);
        let position = open_long(100.0);
        let signal = exit_signal(110.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx).0, 1.0);
    }

    #[test]
    fn scaling_vetoes_entry_with_open_position() {
        let pipeline = PositionRulePipeline::new(vec![PositionRule::Scaling(ScalingRule {
            allow_scale_in: false,
            allow_scale_out: true,
        })]);
        let position = open_long(100.0);
        let signal = Signal::new("AAPL", ts(10), SignalType::Buy, 101.0, Side::Long);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert!(!pipeline.decide_entry(&ctx));
    }

    #[test]
    fn scaling_allows_entry_when_flat() {
        let pipeline = PositionRulePipeline::new(vec![PositionRule::Scaling(ScalingRule {
            allow_scale_in: false,
            allow_scale_out: true,
        })]);
        let position = PositionState::default();
        let signal = Signal::new("AAPL", ts(10), SignalType::Buy, 101.0, Side::Long);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert!(pipeline.decide_entry(&ctx));
    }

    #[test]
    fn rolling_max_anchor_uses_bars_up_to_signal_time() {
        let frame = sample_frame(&[
            (1, 100.0, 105.0, 99.0, 104.0),
            (2, 104.0, 120.0, 103.0, 118.0),
            (3, 118.0, 119.0, 110.0, 112.0),
            (8, 112.0, 150.0, 111.0, 149.0), // after the signal; must be ignored
        ]);
        let rule = PositionRule::StopLoss(StopLossRule {
            field_price: "price".to_string(),
            loss_pct: 0.05,
            fraction: 1.0,
            anchor: AnchorConfig {
                anchor_type: AnchorType::RollingMax,
                anchor_field: "high".to_string(),
                lookback_bars: None,
            },
            one_shot: true,
        });
        let mut pipeline = PositionRulePipeline::new(vec![rule]);
        let position = open_long(100.0);
        // Anchor = max(high through day 3) = 120; 112 is > 5% below it.
        let signal = exit_signal(112.0, 3);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: Some(&frame),
        };
        assert_eq!(pipeline.decide_exit(&ctx).0, 1.0);
    }

    #[test]
    fn rolling_anchor_respects_lookback() {
        let frame = sample_frame(&[
            (1, 100.0, 200.0, 99.0, 104.0), // outside lookback
            (2, 104.0, 106.0, 103.0, 105.0),
            (3, 105.0, 107.0, 104.0, 106.0),
        ]);
        let rule = PositionRule::StopLoss(StopLossRule {
            field_price: "price".to_string(),
            loss_pct: 0.05,
            fraction: 1.0,
            anchor: AnchorConfig {
                anchor_type: AnchorType::RollingMax,
                anchor_field: "high".to_string(),
                lookback_bars: Some(2),
            },
            one_shot: true,
        });
        let mut pipeline = PositionRulePipeline::new(vec![rule]);
        let position = open_long(100.0);
        // Anchor limited to last 2 bars = 107, so 106 is not a 5% loss.
        let signal = exit_signal(106.0, 3);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: Some(&frame),
        };
        assert_eq!(pipeline.decide_exit(&ctx).0, 0.0);
    }

    #[test]
    fn missing_anchor_data_mutes_rule() {
        let rule = PositionRule::StopLoss(StopLossRule {
            field_price: "price".to_string(),
            loss_pct: 0.05,
            fraction: 1.0,
            anchor: AnchorConfig {
                anchor_type: AnchorType::RollingMax,
                anchor_field: "high".to_string(),
                lookback_bars: None,
            },
            one_shot: true,
        });
        let mut pipeline = PositionRulePipeline::new(vec![rule]);
        let position = open_long(100.0);
        let signal = exit_signal(50.0, 3);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx), (0.0, None));
    }

    #[test]
    fn unknown_anchor_field_mutes_rule() {
        let frame = sample_frame(&[(1, 100.0, 105.0, 99.0, 104.0)]);
        let rule = PositionRule::StopLoss(StopLossRule {
            field_price: "price".to_string(),
            loss_pct: 0.05,
            fraction: 1.0,
            anchor: AnchorConfig {
                anchor_type: AnchorType::RollingMin,
                anchor_field: "vwap".to_string(),
                lookback_bars: None,
            },
            one_shot: true,
        });
        let mut pipeline = PositionRulePipeline::new(vec![rule]);
        let position = open_long(100.0);
        let signal = exit_signal(50.0, 2);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: Some(&frame),
        };
        assert_eq!(pipeline.decide_exit(&ctx), (0.0, None));
    }

    #[test]
    fn exit_fraction_clamped_to_one() {
        let mut pipeline = PositionRulePipeline::new(vec![tp_rule(0.05, 2.5, false)]);
        let position = open_long(100.0);
        let signal = exit_signal(110.0, 10);
        let ctx = RuleContext {
            signal: &signal,
            position: &position,
            ohlcv: None,
        };
        assert_eq!(pipeline.decide_exit(&ctx).0, 1.0);
    }
}
