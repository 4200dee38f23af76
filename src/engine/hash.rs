use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::types::{ExecutionConfig, WalkForwardParams};
use crate::config::{FiltersConfig, PositionManagerConfig};

/// Everything that participates in the configuration hash. Tickers, date
/// range, and database are deliberately excluded so results stay comparable
/// across scopes.
pub struct HashInputs<'a> {
    pub strategy_params: &'a BTreeMap<String, Value>,
    pub execution: &'a ExecutionConfig,
    pub step_frequency: &'a str,
    pub capital_per_trade: f64,
    pub risk_free_rate: f64,
    pub walk_forward: &'a WalkForwardParams,
    pub position_manager: Option<&'a PositionManagerConfig>,
    pub filters: Option<&'a FiltersConfig>,
}

/// 16-character lowercase hex fingerprint of a backtest configuration.
///
/// The input dictionary is canonicalized by recursive key sorting before
/// hashing; absent optional sections are omitted entirely, never null, so a
/// run without filters hashes differently from one with an empty filter list.
pub fn compute_backtest_hash(inputs: &HashInputs<'_>) -> String {
    let mut args = json!({
        "strategy_params": inputs.strategy_params,
        "execution": {
            "slippage_bps": inputs.execution.slippage_bps,
            "commission_per_share": inputs.execution.commission_per_share,
            "use_limit_orders": inputs.execution.use_limit_orders,
            "fill_delay_minutes": inputs.execution.fill_delay_minutes,
        },
        "backtest": {
            "step_frequency": inputs.step_frequency,
        },
        "capital_per_trade": inputs.capital_per_trade,
        "risk_free_rate": inputs.risk_free_rate,
        "walk_forward": inputs.walk_forward.walk_forward,
        "train_days": inputs.walk_forward.train_days,
        "test_days": inputs.walk_forward.test_days,
        "train_split": inputs.walk_forward.train_split,
    });

    let root = args.as_object_mut().expect("hash input is an object");
    if let Some(pm) = inputs.position_manager {
        root.insert(
            "position_manager".to_string(),
            serde_json::to_value(pm).expect("position manager config serializes"),
        );
    }
    if let Some(filters) = inputs.filters {
        root.insert(
            "filters".to_string(),
            serde_json::to_value(filters).expect("filter config serializes"),
        );
    }

    let canonical = canonicalize(&args);
    let encoded = serde_json::to_string(&canonical).expect("canonical value serializes");

    let digest = Sha256::digest(encoded.as_bytes());
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// Rebuild a JSON value with every object's keys sorted, independent of the
/// map implementation serde_json was compiled with.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
