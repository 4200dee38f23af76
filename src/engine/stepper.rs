use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::collections::HashMap;

use crate::data::OhlcvFrame;

/// Resolved step size for backtest iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSize {
    Days(i64),
    Hours(i64),
    Minutes(i64),
    Seconds(i64),
}

impl StepSize {
    fn duration(self) -> Duration {
        match self {
            StepSize::Days(n) => Duration::days(n),
            StepSize::Hours(n) => Duration::hours(n),
            StepSize::Minutes(n) => Duration::minutes(n),
            StepSize::Seconds(n) => Duration::seconds(n),
        }
    }
}

/// Translates a step frequency into explicit UTC timestamps over the backtest
/// range.
///
/// Accepted forms: `auto`, `daily`, `hourly`, `minute`, or an explicit code
/// `D`/`H`/`T`/`S` with an optional multiple (`15T`). `auto` takes the mode
/// of inter-bar deltas across all cached tickers; an unrecognized frequency
/// logs an error and falls back to daily.
pub struct TimeStepper {
    step_frequency: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

impl TimeStepper {
    pub fn new(
        step_frequency: impl Into<String>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            step_frequency: step_frequency.into(),
            start_date,
            end_date,
        }
    }

    pub fn determine_step_intervals(
        &self,
        data_cache: &FxHashMap<String, OhlcvFrame>,
    ) -> Vec<DateTime<Utc>> {
        let step = if self.step_frequency == "auto" {
            match auto_detect_step(data_cache) {
                Some(step) => {
                    tracing::info!("Auto-detected step frequency: {step:?}");
                    step
                }
                None => return Vec::new(),
            }
        } else {
            parse_frequency(&self.step_frequency).unwrap_or_else(|| {
                tracing::error!(
                    "Invalid frequency '{}', falling back to daily",
                    self.step_frequency
                );
                StepSize::Days(1)
            })
        };

        self.generate(step)
    }

    fn generate(&self, step: StepSize) -> Vec<DateTime<Utc>> {
        let duration = step.duration();
        if duration <= Duration::zero() {
            tracing::error!("Non-positive step duration, falling back to daily");
            return self.generate(StepSize::Days(1));
        }

        let mut intervals = Vec::new();
        let mut current = self.start_date;
        while current <= self.end_date {
            intervals.push(current);
            current += duration;
        }
        intervals
    }
}

fn parse_frequency(freq: &str) -> Option<StepSize> {
    match freq {
        "daily" => return Some(StepSize::Days(1)),
        "hourly" => return Some(StepSize::Hours(1)),
        "minute" => return Some(StepSize::Minutes(1)),
        _ => {}
    }

    let (digits, code) = freq.split_at(freq.len().saturating_sub(1));
    let multiple = if digits.is_empty() {
        1
    } else {
        digits.parse::<i64>().ok().filter(|n| *n > 0)?
    };
    match code {
        "D" => Some(StepSize::Days(multiple)),
        "H" => Some(StepSize::Hours(multiple)),
        "T" => Some(StepSize::Minutes(multiple)),
        "S" => Some(StepSize::Seconds(multiple)),
        _ => None,
    }
}

/// Mode of inter-bar deltas pooled across every ticker, mapped onto the
/// coarsest fitting step. Heterogeneous bar intervals therefore resolve to a
/// single global step.
fn auto_detect_step(data_cache: &FxHashMap<String, OhlcvFrame>) -> Option<StepSize> {
    let mut all_times: Vec<DateTime<Utc>> = data_cache
        .values()
        .flat_map(|frame| frame.times().iter().copied())
        .collect();
    if all_times.is_empty() {
        return None;
    }
    all_times.sort();

    let mut delta_counts: HashMap<i64, usize> = HashMap::new();
    for pair in all_times.windows(2) {
        let delta = (pair[1] - pair[0]).num_seconds();
        if delta > 0 {
            *delta_counts.entry(delta).or_insert(0) += 1;
        }
    }

    let most_common_secs = delta_counts
        .into_iter()
        .max_by_key(|&(delta, count)| (count, std::cmp::Reverse(delta)))
        .map_or(86_400, |(delta, _)| delta);

    Some(step_for_seconds(most_common_secs))
}

fn step_for_seconds(secs: i64) -> StepSize {
    if secs >= 86_400 {
        StepSize::Days(1)
    } else if secs >= 3_600 {
        StepSize::Hours(1)
    } else if secs >= 60 {
        StepSize::Minutes(1)
    } else {
        StepSize::Seconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sample_frame;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn no_data() -> FxHashMap<String, OhlcvFrame> {
        FxHashMap::default()
    }

    #[test]
    fn daily_intervals_inclusive() {
        let stepper = TimeStepper::new("daily", ts(1), ts(5));
        let intervals = stepper.determine_step_intervals(&no_data());
        assert_eq!(intervals.len(), 5);
        assert_eq!(intervals[0], ts(1));
        assert_eq!(intervals[4], ts(5));
    }

    #[test]
    fn hourly_intervals() {
        let stepper = TimeStepper::new("hourly", ts(1), ts(2));
        let intervals = stepper.determine_step_intervals(&no_data());
        assert_eq!(intervals.len(), 25);
    }

    #[test]
    fn explicit_pandas_style_codes() {
        let stepper = TimeStepper::new("D", ts(1), ts(3));
        assert_eq!(stepper.determine_step_intervals(&no_data()).len(), 3);

        let stepper = TimeStepper::new("15T", ts(1), ts(1) + Duration::hours(1));
        assert_eq!(stepper.determine_step_intervals(&no_data()).len(), 5);
    }

    #[test]
    fn invalid_frequency_falls_back_to_daily() {
        let stepper = TimeStepper::new("fortnightly", ts(1), ts(4));
        let intervals = stepper.determine_step_intervals(&no_data());
        assert_eq!(intervals.len(), 4);
        assert_eq!(intervals[1] - intervals[0], Duration::days(1));
    }

    #[test]
    fn auto_with_no_data_is_empty() {
        let stepper = TimeStepper::new("auto", ts(1), ts(5));
        assert!(stepper.determine_step_intervals(&no_data()).is_empty());
    }

    #[test]
    fn auto_detects_daily_bars() {
        let mut data = FxHashMap::default();
        data.insert(
            "AAPL".to_string(),
            sample_frame(&[
                (1, 1.0, 1.0, 1.0, 1.0),
                (2, 1.0, 1.0, 1.0, 1.0),
                (3, 1.0, 1.0, 1.0, 1.0),
            ]),
        );
        let stepper = TimeStepper::new("auto", ts(1), ts(5));
        let intervals = stepper.determine_step_intervals(&data);
        assert_eq!(intervals.len(), 5);
        assert_eq!(intervals[1] - intervals[0], Duration::days(1));
    }

    #[test]
    fn auto_picks_the_modal_delta() {
        // Mostly daily bars with one large gap: mode is daily.
        let mut data = FxHashMap::default();
        data.insert(
            "AAPL".to_string(),
            sample_frame(&[
                (1, 1.0, 1.0, 1.0, 1.0),
                (2, 1.0, 1.0, 1.0, 1.0),
                (3, 1.0, 1.0, 1.0, 1.0),
                (10, 1.0, 1.0, 1.0, 1.0),
            ]),
        );
        let stepper = TimeStepper::new("auto", ts(1), ts(3));
        let intervals = stepper.determine_step_intervals(&data);
        assert_eq!(intervals[1] - intervals[0], Duration::days(1));
    }

    #[test]
    fn parse_frequency_variants() {
        assert_eq!(parse_frequency("daily"), Some(StepSize::Days(1)));
        assert_eq!(parse_frequency("H"), Some(StepSize::Hours(1)));
        assert_eq!(parse_frequency("30S"), Some(StepSize::Seconds(30)));
        assert_eq!(parse_frequency("0T"), None);
        assert_eq!(parse_frequency("weekly"), None);
    }

    #[test]
    fn step_for_seconds_thresholds() {
        assert_eq!(step_for_seconds(86_400), StepSize::Days(1));
        assert_eq!(step_for_seconds(7_200), StepSize::Hours(1));
        assert_eq!(step_for_seconds(300), StepSize::Minutes(1));
        assert_eq!(step_for_seconds(5), StepSize::Seconds(1));
    }
}
