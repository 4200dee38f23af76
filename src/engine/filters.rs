use anyhow::{bail, Result};
use rustc_hash::FxHashMap;

use super::types::Signal;
use crate::config::{FilterSpec, FiltersConfig};
use crate::data::OhlcvFrame;

pub const FLOAT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn parse(tag: &str) -> Result<Self> {
        Ok(match tag {
            ">" => CmpOp::Gt,
            "<" => CmpOp::Lt,
            ">=" => CmpOp::Ge,
            "<=" => CmpOp::Le,
            "==" => CmpOp::Eq,
            "!=" => CmpOp::Ne,
            other => bail!("invalid comparison operator: {other}"),
        })
    }

    /// Float comparison with an epsilon band on equality.
    pub fn compare(self, left: f64, right: f64) -> bool {
        match self {
            CmpOp::Gt => left > right,
            CmpOp::Lt => left < right,
            CmpOp::Ge => left >= right,
            CmpOp::Le => left <= right,
            CmpOp::Eq => (left - right).abs() < FLOAT_EPSILON,
            CmpOp::Ne => (left - right).abs() >= FLOAT_EPSILON,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriceComparisonFilter {
    pub field: String,
    pub op: CmpOp,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct SmaComparisonFilter {
    pub field_fast: String,
    pub field_slow: String,
    pub op: CmpOp,
    pub fast_window: Option<usize>,
    pub slow_window: Option<usize>,
}

/// Closed set of signal filters; dispatch is by variant.
#[derive(Debug, Clone)]
pub enum Filter {
    PriceComparison(PriceComparisonFilter),
    SmaComparison(SmaComparisonFilter),
}

pub struct FilterContext<'a> {
    pub signal: &'a Signal,
    pub ohlcv_by_ticker: &'a FxHashMap<String, OhlcvFrame>,
}

impl FilterContext<'_> {
    fn ticker_ohlcv(&self) -> Option<&OhlcvFrame> {
        self.ohlcv_by_ticker.get(&self.signal.ticker)
    }
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::PriceComparison(_) => "price_comparison",
            Filter::SmaComparison(_) => "sma_comparison",
        }
    }

    /// `Ok(false)` is a rejection; `Err` is treated as a rejection by the
    /// pipeline and logged at warning level.
    pub fn evaluate(&self, ctx: &FilterContext<'_>) -> Result<bool> {
        match self {
            Filter::PriceComparison(f) => Ok(evaluate_price_comparison(f, ctx)),
            Filter::SmaComparison(f) => Ok(evaluate_sma_comparison(f, ctx)),
        }
    }
}

fn evaluate_price_comparison(filter: &PriceComparisonFilter, ctx: &FilterContext<'_>) -> bool {
    let Some(field_value) = ctx.signal.field(&filter.field) else {
        tracing::debug!("Field {} not found in signal, rejecting", filter.field);
        return false;
    };
    if !field_value.is_finite() {
        tracing::debug!("Field {} is not a finite number, rejecting", filter.field);
        return false;
    }
    filter.op.compare(field_value, filter.value)
}

fn evaluate_sma_comparison(filter: &SmaComparisonFilter, ctx: &FilterContext<'_>) -> bool {
    let ticker = &ctx.signal.ticker;
    let ohlcv = ctx.ticker_ohlcv();

    let (fast, slow) = match (ohlcv, filter.fast_window, filter.slow_window) {
        (Some(frame), Some(fast_window), Some(slow_window)) if !frame.is_empty() => {
            let fast = sma_of_closes(frame, fast_window);
            let slow = sma_of_closes(frame, slow_window);
            (fast, slow)
        }
        _ => (
            ctx.signal.field(&filter.field_fast),
            ctx.signal.field(&filter.field_slow),
        ),
    };

    let (Some(fast), Some(slow)) = (fast, slow) else {
        tracing::debug!("Cannot compute SMA values for {ticker}, rejecting");
        return false;
    };
    filter.op.compare(fast, slow)
}

/// Trailing SMA of the close column; `None` when the history is shorter than
/// the window.
fn sma_of_closes(frame: &OhlcvFrame, window: usize) -> Option<f64> {
    let closes = frame.close();
    if window == 0 || closes.len() < window {
        return None;
    }
    let series = rust_ti::standard_indicators::bulk::simple_moving_average(closes, window);
    series.last().copied()
}

/// Ordered, short-circuiting predicate chain over signals.
pub struct FilterPipeline {
    filters: Vec<Filter>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    pub fn from_config(config: &FiltersConfig) -> Result<Self> {
        let mut filters = Vec::with_capacity(config.filters.len());
        for spec in &config.filters {
            filters.push(match spec {
                FilterSpec::PriceComparison(p) => Filter::PriceComparison(PriceComparisonFilter {
                    field: p.field.clone(),
                    op: CmpOp::parse(&p.operator)?,
                    value: p.value,
                }),
                FilterSpec::SmaComparison(p) => Filter::SmaComparison(SmaComparisonFilter {
                    field_fast: p.field_fast.clone(),
                    field_slow: p.field_slow.clone(),
                    op: CmpOp::parse(&p.operator)?,
                    fast_window: p.fast_window,
                    slow_window: p.slow_window,
                }),
            });
        }
        Ok(Self::new(filters))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// First rejection short-circuits; a filter error rejects the signal
    /// without poisoning the rest of the batch.
    pub fn is_valid(
        &self,
        signal: &Signal,
        ohlcv_by_ticker: &FxHashMap<String, OhlcvFrame>,
    ) -> bool {
        let ctx = FilterContext {
            signal,
            ohlcv_by_ticker,
        };
        for filter in &self.filters {
            match filter.evaluate(&ctx) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        "Filter {} rejected signal for {} at {}",
                        filter.name(),
                        signal.ticker,
                        signal.signal_time
                    );
                    return false;
                }
                Err(e) => {
                    tracing::warn!(
                        "Filter {} raised error for {} at {}: {e}",
                        filter.name(),
                        signal.ticker,
                        signal.signal_time
                    );
                    return false;
                }
            }
        }
        true
    }

    pub fn apply(
        &self,
        signals: Vec<Signal>,
        ohlcv_by_ticker: &FxHashMap<String, OhlcvFrame>,
    ) -> Vec<Signal> {
        if self.filters.is_empty() {
            return signals;
        }
        signals
            .into_iter()
            .filter(|s| self.is_valid(s, ohlcv_by_ticker))
            .collect()
    }
}
