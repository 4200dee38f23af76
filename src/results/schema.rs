use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Column-oriented time-series payload: a required millisecond `datetime`
/// column plus arbitrary same-length columns.
///
/// This is the wire contract between the backtest layer and the downstream
/// results publisher; validation here keeps malformed tables out of the
/// queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeriesData {
    pub datetime: Vec<i64>,
    #[serde(flatten)]
    pub columns: BTreeMap<String, Value>,
}

impl TimeSeriesData {
    pub fn insert_column(&mut self, name: impl Into<String>, values: Value) {
        self.columns.insert(name.into(), values);
    }
}

fn non_blank(value: &str, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("must be a non-empty string"));
    }
    Ok(())
}

fn valid_time_series(data: &TimeSeriesData, _ctx: &()) -> garde::Result {
    if data.datetime.is_empty() {
        return Err(garde::Error::new("datetime array must not be empty"));
    }
    if data.datetime.iter().any(|&ms| ms < 0) {
        return Err(garde::Error::new(
            "datetime values must be non-negative millisecond timestamps",
        ));
    }
    let expected_len = data.datetime.len();
    for (key, value) in &data.columns {
        if let Value::Array(items) = value {
            if items.len() != expected_len {
                return Err(garde::Error::new(format!(
                    "length mismatch for column '{key}': expected {expected_len}, got {}",
                    items.len()
                )));
            }
        }
    }
    Ok(())
}

fn valid_param_keys(params: &Option<BTreeMap<String, Value>>, _ctx: &()) -> garde::Result {
    if let Some(params) = params {
        for key in params.keys() {
            if key.trim().is_empty() {
                return Err(garde::Error::new(
                    "strategy parameter keys must be non-empty strings",
                ));
            }
        }
    }
    Ok(())
}

/// Item schema for the backtest trades queue.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BacktestTradesPayload {
    #[garde(custom(non_blank))]
    pub ticker: String,
    #[garde(custom(non_blank))]
    pub strategy_name: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtest_id: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_id: Option<String>,
    #[garde(custom(valid_param_keys))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_params: Option<BTreeMap<String, Value>>,
    #[garde(custom(valid_time_series))]
    pub data: TimeSeriesData,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_stage: Option<String>,
}

/// Item schema for the backtest metrics queue.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BacktestMetricsPayload {
    #[garde(custom(non_blank))]
    pub ticker: String,
    #[garde(custom(non_blank))]
    pub strategy_name: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtest_id: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_id: Option<String>,
    #[garde(custom(valid_time_series))]
    pub data: TimeSeriesData,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// Item schema for the backtest studies queue.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BacktestStudiesPayload {
    #[garde(custom(non_blank))]
    pub ticker: String,
    #[garde(custom(non_blank))]
    pub strategy_name: String,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtest_id: Option<String>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_id: Option<String>,
    #[garde(custom(valid_param_keys))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_params: Option<BTreeMap<String, Value>>,
    #[garde(custom(valid_time_series))]
    pub data: TimeSeriesData,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_with(datetime: Vec<i64>, columns: &[(&str, Value)]) -> TimeSeriesData {
        let mut data = TimeSeriesData {
            datetime,
            columns: BTreeMap::new(),
        };
        for (name, values) in columns {
            data.insert_column(*name, values.clone());
        }
        data
    }

    fn trades_payload(data: TimeSeriesData) -> BacktestTradesPayload {
        BacktestTradesPayload {
            ticker: "AAPL".to_string(),
            strategy_name: "demo".to_string(),
            backtest_id: Some("bt-1".to_string()),
            hash_id: Some("a1b2c3d4e5f60718".to_string()),
            strategy_params: None,
            data,
            database: None,
            portfolio_stage: Some("phase1".to_string()),
        }
    }

    #[test]
    fn valid_payload_passes() {
        let data = data_with(
            vec![1_700_000_000_000, 1_700_000_060_000],
            &[("price", json!([100.0, 101.0]))],
        );
        assert!(trades_payload(data).validate().is_ok());
    }

    #[test]
    fn empty_datetime_fails() {
        let data = data_with(vec![], &[]);
        assert!(trades_payload(data).validate().is_err());
    }

    #[test]
    fn negative_datetime_fails() {
        let data = data_with(vec![-5], &[]);
        assert!(trades_payload(data).validate().is_err());
    }

    #[test]
    fn column_length_mismatch_fails() {
        let data = data_with(vec![1, 2, 3], &[("price", json!([100.0, 101.0]))]);
        assert!(trades_payload(data).validate().is_err());
    }

    #[test]
    fn scalar_columns_are_allowed() {
        let data = data_with(vec![1, 2], &[("note", json!("aggregate"))]);
        assert!(trades_payload(data).validate().is_ok());
    }

    #[test]
    fn blank_ticker_fails() {
        let data = data_with(vec![1], &[]);
        let mut payload = trades_payload(data);
        payload.ticker = "   ".to_string();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn blank_strategy_param_key_fails() {
        let data = data_with(vec![1], &[]);
        let mut payload = trades_payload(data);
        let mut params = BTreeMap::new();
        params.insert(String::new(), json!(1));
        payload.strategy_params = Some(params);
        assert!(payload.validate().is_err());
    }

    #[test]
    fn payload_serializes_with_flattened_columns() {
        let data = data_with(vec![1], &[("price", json!([100.0]))]);
        let payload = trades_payload(data);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["data"]["datetime"], json!([1]));
        assert_eq!(value["data"]["price"], json!([100.0]));
        assert_eq!(value["portfolio_stage"], json!("phase1"));
    }

    #[test]
    fn metrics_payload_validates() {
        let data = data_with(
            vec![1_700_000_000_000],
            &[("sharpe_ratio", json!([1.25])), ("strategy", json!(["demo"]))],
        );
        let payload = BacktestMetricsPayload {
            ticker: "AAPL".to_string(),
            strategy_name: "demo".to_string(),
            backtest_id: None,
            hash_id: None,
            data,
            database: None,
        };
        assert!(payload.validate().is_ok());
    }
}
