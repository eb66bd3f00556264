//! Configuration loading, validation, and environment variable interpolation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use position_engine::config::load_config;
//!
//! // Load from default path (config.yaml)
//! let config = load_config(None)?;
//!
//! // Load from a custom path
//! let config = load_config(Some("config.example.yaml"))?;
//! println!("swing leverage: {}", config.modes.swing.leverage);
//! ```

pub mod engine;
pub mod modes;
pub mod reconciliation;

use std::net::SocketAddr;
use std::path::PathBuf;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TradingMode;
use crate::gateway::RetryPolicy;

pub use engine::{
    AdvisoryConfig, BlocklistConfig, EngineSettings, EntryConfig, FeesConfig, FundingConfig,
    ProtectionConfig, RiskLevel,
};
pub use modes::{
    BreakerConfig, BreakevenConfig, ModeConfig, ModesConfig, TakeProfitLevelConfig,
    TrailingConfig,
};
pub use reconciliation::{ConflictPolicy, ReconciliationConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Per-mode records.
    #[serde(default)]
    pub modes: ModesConfig,
    /// Account-wide circuit breaker.
    #[serde(default = "BreakerConfig::global_default")]
    pub global_breaker: BreakerConfig,
    /// Per-instrument blocklist.
    #[serde(default)]
    pub blocklist: BlocklistConfig,
    /// Protection guardian.
    #[serde(default)]
    pub protection: ProtectionConfig,
    /// Reconciliation and orphan sweep.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Retry policy for protection-critical gateway calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Fee schedule.
    #[serde(default)]
    pub fees: FeesConfig,
    /// Funding-rate awareness.
    #[serde(default)]
    pub funding: FundingConfig,
    /// Entry and exit execution.
    #[serde(default)]
    pub entry: EntryConfig,
    /// Advisory stop updates.
    #[serde(default)]
    pub advisory: AdvisoryConfig,
    /// On-disk state.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            modes: ModesConfig::default(),
            global_breaker: BreakerConfig::global_default(),
            blocklist: BlocklistConfig::default(),
            protection: ProtectionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            retry: RetryPolicy::default(),
            fees: FeesConfig::default(),
            funding: FundingConfig::default(),
            entry: EntryConfig::default(),
            advisory: AdvisoryConfig::default(),
            persistence: PersistenceConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// On-disk state locations. Unset paths keep the state in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Position progress snapshot file.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Closed-trade journal (JSON lines).
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

/// Observability configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Include span information.
    #[serde(default = "default_true")]
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_spans: true,
        }
    }
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Start the exporter.
    #[serde(default)]
    pub enabled: bool,
    /// Listen address for `/metrics`.
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

/// Load configuration from a YAML file.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.yaml");

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string (useful for testing).
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is a compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map(|m| m.as_str());
        match cap.get(1).map(|m| std::env::var(m.as_str())) {
            Some(Ok(v)) if !v.is_empty() => v,
            _ => default_value.map_or_else(String::new, str::to_string),
        }
    })
    .into_owned()
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn check_pct(name: &str, value: Decimal) -> Result<(), ConfigError> {
    if value < Decimal::ZERO || value > dec!(100) {
        return Err(invalid(format!("{name} must be between 0 and 100")));
    }
    Ok(())
}

/// Validate configuration values.
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` naming the first offending field.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.modes.enabled().next().is_none() {
        return Err(invalid("at least one trading mode must be enabled"));
    }

    for mode in TradingMode::ALL {
        validate_mode(mode, config.modes.get(mode))?;
    }

    let total_allocation: Decimal = TradingMode::base_modes()
        .map(|m| config.modes.get(m).allocation_pct)
        .sum();
    if total_allocation > dec!(100) {
        return Err(invalid(format!(
            "mode allocations sum to {total_allocation}%, above 100%"
        )));
    }

    if config.engine.monitor_interval_ms == 0
        || config.engine.pending_sweep_interval_ms == 0
        || config.protection.guardian_interval_ms == 0
        || config.reconciliation.orphan_sweep_interval_secs == 0
    {
        return Err(invalid("loop intervals must be greater than zero"));
    }
    if config.engine.reconcile_every_ticks == 0 {
        return Err(invalid("engine.reconcile_every_ticks must be at least 1"));
    }
    if config.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if config.protection.max_heal_attempts == 0 {
        return Err(invalid("protection.max_heal_attempts must be at least 1"));
    }
    if config.reconciliation.max_orders_per_position < 2 {
        return Err(invalid(
            "reconciliation.max_orders_per_position must allow a stop and a target",
        ));
    }

    check_pct("engine.trigger_tolerance_pct", config.engine.trigger_tolerance_pct)?;
    check_pct("entry.usable_balance_pct", config.entry.usable_balance_pct)?;
    check_pct("entry.partial_completion_pct", config.entry.partial_completion_pct)?;
    check_pct("reconciliation.qty_tolerance_pct", config.reconciliation.qty_tolerance_pct)?;

    if config.blocklist.big_loss_roi_pct >= Decimal::ZERO
        || config.blocklist.consecutive_loss_roi_pct >= Decimal::ZERO
    {
        return Err(invalid("blocklist ROI thresholds must be negative"));
    }

    if config.observability.metrics.enabled
        && config
            .observability
            .metrics
            .listen_addr
            .parse::<SocketAddr>()
            .is_err()
    {
        return Err(invalid(format!(
            "observability.metrics.listen_addr '{}' is not a socket address",
            config.observability.metrics.listen_addr
        )));
    }

    Ok(())
}

fn validate_mode(mode: TradingMode, cfg: &ModeConfig) -> Result<(), ConfigError> {
    if cfg.leverage == 0 {
        return Err(invalid(format!("modes.{mode}.leverage must be at least 1")));
    }
    if cfg.stop_loss_pct <= Decimal::ZERO {
        return Err(invalid(format!("modes.{mode}.stop_loss_pct must be positive")));
    }
    if cfg.min_position_usd > cfg.max_position_usd {
        return Err(invalid(format!(
            "modes.{mode}.min_position_usd exceeds max_position_usd"
        )));
    }
    if cfg.max_positions == 0 && cfg.enabled {
        return Err(invalid(format!("modes.{mode}.max_positions must be at least 1")));
    }
    check_pct(&format!("modes.{mode}.allocation_pct"), cfg.allocation_pct)?;

    if cfg.take_profits.is_empty() {
        return Err(invalid(format!("modes.{mode}.take_profits must not be empty")));
    }
    let total: Decimal = cfg.take_profits.iter().map(|l| l.close_pct).sum();
    if total != dec!(100) {
        return Err(invalid(format!(
            "modes.{mode}.take_profits close_pct must sum to 100 (got {total})"
        )));
    }
    let ascending = cfg
        .take_profits
        .windows(2)
        .all(|w| w[0].gain_pct < w[1].gain_pct);
    if !ascending || cfg.take_profits.iter().any(|l| l.gain_pct <= Decimal::ZERO) {
        return Err(invalid(format!(
            "modes.{mode}.take_profits gains must be positive and ascending"
        )));
    }
    if cfg.trailing.enabled && cfg.trailing.trail_pct <= Decimal::ZERO {
        return Err(invalid(format!("modes.{mode}.trailing.trail_pct must be positive")));
    }
    if cfg.breaker.win_rate_sample_size == 0 {
        return Err(invalid(format!(
            "modes.{mode}.breaker.win_rate_sample_size must be at least 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = match load_config_from_string("{}") {
            Ok(c) => c,
            Err(e) => panic!("should load empty config: {e}"),
        };
        assert_eq!(config, Config::default());
        assert!(config.engine.paper);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.protection.max_heal_attempts, 3);
        assert_eq!(config.global_breaker.max_consecutive_losses, 5);
    }

    #[test]
    fn partial_mode_section_overrides_fields() {
        let yaml = r"
modes:
  position:
    enabled: true
    leverage: 2
    allocation_pct: 20
";
        let config = match load_config_from_string(yaml) {
            Ok(c) => c,
            Err(e) => panic!("should load: {e}"),
        };
        assert!(config.modes.position.enabled);
        assert_eq!(config.modes.position.leverage, 2);
        assert!(config.modes.swing.enabled);
    }

    #[test]
    fn decimals_parse_from_yaml_numbers() {
        let yaml = r"
fees:
  taker_pct: 0.05
engine:
  risk_level: aggressive
reconciliation:
  conflict_policy: defer_to_guardian
";
        let config = match load_config_from_string(yaml) {
            Ok(c) => c,
            Err(e) => panic!("should load: {e}"),
        };
        assert_eq!(config.fees.taker_pct, dec!(0.05));
        assert_eq!(config.engine.risk_level, RiskLevel::Aggressive);
        assert_eq!(
            config.reconciliation.conflict_policy,
            ConflictPolicy::DeferToGuardian
        );
    }

    #[test]
    fn take_profit_allocation_must_sum_to_100() {
        let yaml = r"
modes:
  scalp:
    enabled: true
    take_profits:
      - { gain_pct: 0.5, close_pct: 50 }
      - { gain_pct: 1.0, close_pct: 40 }
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("ladder summing to 90 should be rejected");
        };
        assert!(err.to_string().contains("sum to 100"));
    }

    #[test]
    fn all_modes_disabled_is_rejected() {
        let yaml = r"
modes:
  scalp: { enabled: false }
  swing: { enabled: false }
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("no enabled mode should be rejected");
        };
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn over_allocation_is_rejected() {
        let yaml = r"
modes:
  scalp: { enabled: true, allocation_pct: 60 }
  swing: { enabled: true, allocation_pct: 60 }
";
        assert!(load_config_from_string(yaml).is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let yaml = r"
protection:
  guardian_interval_ms: 0
";
        assert!(load_config_from_string(yaml).is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = load_config(Some("/definitely/not/here.yaml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "engine:\n  monitor_interval_ms: 250\n").unwrap();
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.engine.monitor_interval_ms, 250);
    }

    #[test]
    fn env_var_with_default_when_missing() {
        let input = "level: ${POSITION_ENGINE_TEST_NONEXISTENT_VAR:-debug}";
        assert_eq!(interpolate_env_vars(input), "level: debug");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)] // ${...} is env var syntax
    fn env_var_with_default_uses_existing() {
        let input = "path: ${PATH:-default}";
        let result = interpolate_env_vars(input);
        assert_ne!(result, "path: default");
        assert!(result.starts_with("path: "));
    }

    #[test]
    fn env_var_without_default_becomes_empty() {
        let input = "key: ${POSITION_ENGINE_TEST_UNLIKELY_TO_EXIST}";
        assert_eq!(interpolate_env_vars(input), "key: ");
    }
}
