pub mod cache;
pub mod kv;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use polars::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::RwLock;

use crate::engine::types::{ExecutionIntent, Side};

pub const TIME_COL: &str = "time";

/// A ticker's OHLCV bars in strict time order.
///
/// This is the typed working form used by the engine hot path; `DataFrame` is
/// the interchange form at the source and cache boundaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OhlcvFrame {
    times: Vec<DateTime<Utc>>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<i64>,
}

impl OhlcvFrame {
    /// Build a frame, enforcing equal column lengths and strictly increasing
    /// timestamps with no duplicates.
    pub fn new(
        times: Vec<DateTime<Utc>>,
        open: Vec<f64>,
        high: Vec<f64>,
        low: Vec<f64>,
        close: Vec<f64>,
        volume: Vec<i64>,
    ) -> Result<Self> {
        let n = times.len();
        if open.len() != n || high.len() != n || low.len() != n || close.len() != n || volume.len() != n
        {
            bail!("OHLCV columns have mismatched lengths");
        }
        for pair in times.windows(2) {
            if pair[1] <= pair[0] {
                bail!(
                    "OHLCV timestamps must be strictly increasing: {} followed by {}",
                    pair[0],
                    pair[1]
                );
            }
        }
        Ok(Self {
            times,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn open(&self) -> &[f64] {
        &self.open
    }

    pub fn high(&self) -> &[f64] {
        &self.high
    }

    pub fn low(&self) -> &[f64] {
        &self.low
    }

    pub fn close(&self) -> &[f64] {
        &self.close
    }

    pub fn volume(&self) -> &[i64] {
        &self.volume
    }

    /// Price column by name, for anchor-field lookups.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        match name {
            "open" => Some(&self.open),
            "high" => Some(&self.high),
            "low" => Some(&self.low),
            "close" | "price" => Some(&self.close),
            _ => None,
        }
    }

    /// Index of the first bar at or after `t`, if any.
    pub fn first_bar_at_or_after(&self, t: DateTime<Utc>) -> Option<usize> {
        let idx = self.times.partition_point(|&bar| bar < t);
        (idx < self.times.len()).then_some(idx)
    }

    /// Number of leading bars with `time <= asof`.
    pub fn bars_through(&self, asof: DateTime<Utc>) -> usize {
        self.times.partition_point(|&bar| bar <= asof)
    }

    /// Sub-frame of the given index range.
    pub fn slice_range(&self, start: usize, end: usize) -> OhlcvFrame {
        let end = end.min(self.len());
        let start = start.min(end);
        OhlcvFrame {
            times: self.times[start..end].to_vec(),
            open: self.open[start..end].to_vec(),
            high: self.high[start..end].to_vec(),
            low: self.low[start..end].to_vec(),
            close: self.close[start..end].to_vec(),
            volume: self.volume[start..end].to_vec(),
        }
    }

    /// All bars with `time <= asof`.
    pub fn slice_through(&self, asof: DateTime<Utc>) -> OhlcvFrame {
        self.slice_range(0, self.bars_through(asof))
    }

    /// All bars with `start <= time <= end`.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> OhlcvFrame {
        let lo = self.times.partition_point(|&bar| bar < start);
        let hi = self.times.partition_point(|&bar| bar <= end);
        self.slice_range(lo, hi)
    }

    /// Convert to the interchange `DataFrame`. Time is stored as epoch
    /// microseconds so the encoding round-trips the UTC index exactly.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let time_us: Vec<i64> = self.times.iter().map(DateTime::timestamp_micros).collect();
        let df = df! {
            TIME_COL => &time_us,
            "open" => &self.open,
            "high" => &self.high,
            "low" => &self.low,
            "close" => &self.close,
            "volume" => &self.volume,
        }?;
        Ok(df)
    }

    pub fn from_dataframe(df: &DataFrame) -> Result<Self> {
        let time_us = df
            .column(TIME_COL)
            .context("OHLCV frame missing time column")?
            .i64()?;
        let mut times = Vec::with_capacity(df.height());
        for v in time_us {
            let us = v.context("null timestamp in OHLCV frame")?;
            let ts = Utc
                .timestamp_micros(us)
                .single()
                .with_context(|| format!("invalid epoch microseconds: {us}"))?;
            times.push(ts);
        }

        let f64_col = |name: &str| -> Result<Vec<f64>> {
            let col = df
                .column(name)
                .with_context(|| format!("OHLCV frame missing {name} column"))?
                .f64()?;
            Ok(col.into_iter().map(Option::unwrap_or_default).collect())
        };
        let volume: Vec<i64> = df
            .column("volume")
            .context("OHLCV frame missing volume column")?
            .i64()?
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect();

        Self::new(
            times,
            f64_col("open")?,
            f64_col("high")?,
            f64_col("low")?,
            f64_col("close")?,
            volume,
        )
    }
}

/// Historical OHLCV bars for a ticker over a UTC time range.
///
/// Implementations wrap whatever backing store holds market data; bars come
/// back time-ascending. `None` means the ticker has no data in range.
pub trait OhlcvSource: Send + Sync {
    fn query(
        &self,
        ticker: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<DataFrame>>;
}

/// In-memory OHLCV source backed by preloaded frames.
#[derive(Default)]
pub struct MemoryOhlcvSource {
    frames: RwLock<FxHashMap<String, OhlcvFrame>>,
}

impl MemoryOhlcvSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ticker: impl Into<String>, frame: OhlcvFrame) {
        self.frames
            .write()
            .expect("ohlcv source lock poisoned")
            .insert(ticker.into(), frame);
    }
}

impl OhlcvSource for MemoryOhlcvSource {
    fn query(
        &self,
        ticker: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<DataFrame>> {
        let frames = self.frames.read().expect("ohlcv source lock poisoned");
        let Some(frame) = frames.get(ticker) else {
            return Ok(None);
        };
        let sliced = frame.between(start, end);
        if sliced.is_empty() {
            return Ok(None);
        }
        Ok(Some(sliced.to_dataframe()?))
    }
}

/// One phase-1 execution row as published to the results database.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub intent: ExecutionIntent,
    pub strategy: String,
    pub hash_id: String,
}

impl ExecutionRecord {
    pub fn side(&self) -> Side {
        self.intent.side
    }
}

/// Phase-1 executions keyed by configuration hash.
pub trait ExecutionStore: Send + Sync {
    fn query_executions(&self, hash_id: &str) -> Result<Vec<ExecutionRecord>>;
}

/// In-memory execution store for embedded runs and tests.
#[derive(Default)]
pub struct MemoryExecutionStore {
    records: RwLock<Vec<ExecutionRecord>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ExecutionRecord) {
        self.records
            .write()
            .expect("execution store lock poisoned")
            .push(record);
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn query_executions(&self, hash_id: &str) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.read().expect("execution store lock poisoned");
        let mut out: Vec<ExecutionRecord> = records
            .iter()
            .filter(|r| r.hash_id == hash_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.intent.signal_time);
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) fn sample_frame(days: &[(u32, f64, f64, f64, f64)]) -> OhlcvFrame {
    let mut times = Vec::new();
    let mut open = Vec::new();
    let mut high = Vec::new();
    let mut low = Vec::new();
    let mut close = Vec::new();
    let mut volume = Vec::new();
    for &(day, o, h, l, c) in days {
        times.push(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap());
        open.push(o);
        high.push(h);
        low.push(l);
        close.push(c);
        volume.push(1_000);
    }
    OhlcvFrame::new(times, open, high, low, close, volume).unwrap()
}
