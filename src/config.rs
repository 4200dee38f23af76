use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Errors raised while decoding configuration files. Configuration problems
/// abort the run, unlike the advisory cache/queue failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Comparison operator tag shared by the filter configs.
/// Parsed into `engine::filters::CmpOp` when pipelines are built.
pub type OperatorTag = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceComparisonParams {
    pub field: String,
    pub operator: OperatorTag,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmaComparisonParams {
    pub field_fast: String,
    pub field_slow: String,
    pub operator: OperatorTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_window: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_window: Option<usize>,
}

/// One filter entry: `{type: ..., params: {...}}`. The serde tag is the
/// registry that maps config names onto filter constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum FilterSpec {
    PriceComparison(PriceComparisonParams),
    SmaComparison(SmaComparisonParams),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    #[default]
    EntryPrice,
    RollingMax,
    RollingMin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnchorParams {
    #[serde(rename = "type", default)]
    pub anchor_type: AnchorType,
    /// OHLCV column the rolling anchor reads; defaults to the rule's
    /// `field_price`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_bars: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingParams {
    #[serde(default)]
    pub allow_scale_in: bool,
    #[serde(default = "default_true")]
    pub allow_scale_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitParams {
    pub field_price: String,
    pub target_pct: f64,
    pub fraction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorParams>,
    #[serde(default = "default_true")]
    pub one_shot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossParams {
    pub field_price: String,
    pub loss_pct: f64,
    pub fraction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorParams>,
    #[serde(default = "default_true")]
    pub one_shot: bool,
}

fn default_true() -> bool {
    true
}

/// One position rule entry, written as a single-key map in YAML
/// (`- scaling: {...}`). External serde tagging matches that shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionRuleSpec {
    Scaling(ScalingParams),
    TakeProfit(TakeProfitParams),
    StopLoss(StopLossParams),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionManagerConfig {
    #[serde(default)]
    pub rules: Vec<PositionRuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxCapitalDeployedParams {
    #[serde(default = "default_max_deployed_pct")]
    pub max_deployed_pct: f64,
}

fn default_max_deployed_pct() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FractionalPositionSizeParams {
    #[serde(default = "default_fraction_of_equity")]
    pub fraction_of_equity: f64,
}

fn default_fraction_of_equity() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioRuleSpec {
    MaxCapitalDeployed(MaxCapitalDeployedParams),
    FractionalPositionSize(FractionalPositionSizeParams),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioManagerConfig {
    #[serde(default)]
    pub rules: Vec<PortfolioRuleSpec>,
}

/// Treat a bare name as `<name>.yaml`; explicit paths pass through.
fn resolve_config_path(name: &str) -> PathBuf {
    let candidate = Path::new(name);
    let has_yaml_ext = candidate
        .extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml");
    if has_yaml_ext || name.contains('/') || name.contains('\\') {
        candidate.to_path_buf()
    } else {
        PathBuf::from(format!("{name}.yaml"))
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(name: &str) -> Result<T, ConfigError> {
    let path = resolve_config_path(name);
    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml { path, source })
}

pub fn load_filters_config(name: &str) -> Result<FiltersConfig, ConfigError> {
    let config: FiltersConfig = load_yaml(name)?;
    tracing::info!("Loaded {} filter(s) from {name}", config.filters.len());
    Ok(config)
}

pub fn load_position_manager_config(name: &str) -> Result<PositionManagerConfig, ConfigError> {
    let config: PositionManagerConfig = load_yaml(name)?;
    tracing::info!("Loaded {} position rule(s) from {name}", config.rules.len());
    Ok(config)
}

pub fn load_portfolio_manager_config(name: &str) -> Result<PortfolioManagerConfig, ConfigError> {
    let config: PortfolioManagerConfig = load_yaml(name)?;
    if config.rules.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "no valid rules loaded from {name}"
        )));
    }
    tracing::info!("Loaded {} portfolio rule(s) from {name}", config.rules.len());
    Ok(config)
}
