pub mod filters;
pub mod hash;
pub mod journal;
pub mod metrics;
pub mod portfolio;
pub mod position_manager;
pub mod processor;
pub mod rules;
pub mod simulator;
pub mod stepper;
pub mod types;

use chrono::{DateTime, Utc};

use crate::data::OhlcvFrame;
use self::types::{Signal, StudySeries};

/// A trading strategy as the engine sees it: a name and a per-step signal
/// generator. The slice passed to `run_strategy` holds every bar with
/// `time <= asof`.
pub trait Strategy: Send + Sync {
    fn strategy_name(&self) -> &str;

    fn run_strategy(&self, ticker: &str, asof: DateTime<Utc>, ohlcv: &OhlcvFrame) -> Vec<Signal>;

    /// Optional indicator series to publish alongside the run.
    fn run_studies(&self, _ticker: &str, _ohlcv: &OhlcvFrame) -> Option<StudySeries> {
        None
    }
}
