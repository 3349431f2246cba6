//! Central configuration for the engine.
//!
//! Loads from `config.toml` at the project root. Every section is optional;
//! missing keys fall back to the defaults below.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, Result};
use crate::risk::{AlertThresholds, RiskLimits};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub risk: RiskLimits,
    pub alerts: AlertThresholds,
    pub orders: OrdersConfig,
    pub emergency: EmergencyConfig,
    pub bus: BusConfig,
    pub engine: EngineConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
    /// Starting quote balance of the ledger
    pub initial_balance: Decimal,
    /// Asset that positions are margined in
    pub quote_asset: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info,aleph_gate=debug".to_string(),
            initial_balance: Decimal::from(10_000),
            quote_asset: "USDT".to_string(),
        }
    }
}

/// Order lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrdersConfig {
    /// Status polling interval
    pub poll_interval_ms: u64,
    /// Upper bound on any single venue call
    pub venue_timeout_ms: u64,
    /// Resubmissions allowed after a rejection
    pub max_retries: u32,
    /// Backoff unit; attempt n waits `base * 2^n`
    pub backoff_base_ms: u64,
    /// How long after placement a fill still arms bracket orders
    pub bracket_window_secs: u64,
    /// Default expiry for entry orders, none when unset
    pub default_expire_secs: Option<u64>,
    /// Grace period for background tasks on stop
    pub stop_timeout_ms: u64,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            venue_timeout_ms: 5_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            bracket_window_secs: 300,
            default_expire_secs: None,
            stop_timeout_ms: 5_000,
        }
    }
}

impl OrdersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn venue_timeout(&self) -> Duration {
        Duration::from_millis(self.venue_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn bracket_window(&self) -> Duration {
        Duration::from_secs(self.bracket_window_secs)
    }

    pub fn default_expiry(&self) -> Option<Duration> {
        self.default_expire_secs.map(Duration::from_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Emergency unwind settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Close attempts per position
    pub max_attempts: u32,
    /// Attempt n waits `n * retry_delay` before the next one
    pub retry_delay_ms: u64,
    /// How long to wait for the closing market order to fill
    pub fill_timeout_ms: u64,
    /// Fill polling interval
    pub fill_poll_ms: u64,
    /// Upper bound on any single venue call
    pub venue_timeout_ms: u64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2_000,
            fill_timeout_ms: 10_000,
            fill_poll_ms: 500,
            venue_timeout_ms: 5_000,
        }
    }
}

impl EmergencyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    pub fn fill_poll(&self) -> Duration {
        Duration::from_millis(self.fill_poll_ms)
    }

    pub fn venue_timeout(&self) -> Duration {
        Duration::from_millis(self.venue_timeout_ms)
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bound on draining the queue during stop
    pub stop_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { stop_timeout_ms: 5_000 }
    }
}

impl BusConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Orchestration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Intents below this confidence are ignored
    pub min_confidence: f64,
    /// Period of the risk sweep (metrics, alerts, halt)
    pub risk_check_interval_secs: u64,
    /// Market orders when true, limit at the reference price otherwise
    pub use_market_orders: bool,
    /// Share of the max position size a full-confidence intent targets
    pub sizing_fraction: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
            risk_check_interval_secs: 60,
            use_market_orders: true,
            sizing_fraction: Decimal::new(5, 1),
        }
    }
}

impl EngineConfig {
    pub fn risk_check_interval(&self) -> Duration {
        Duration::from_secs(self.risk_check_interval_secs)
    }
}

impl Config {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location (project root config.toml).
    pub fn load_default() -> Self {
        let candidates = [
            "config.toml",
            concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"),
        ];

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!("📋 Loaded config from {}", path);
                    return cfg;
                }
                Err(Error::Config(msg)) if msg.starts_with("Failed to read") => continue,
                Err(e) => tracing::warn!("⚠️ Ignoring {}: {}", path, e),
            }
        }

        tracing::warn!("⚠️ No config.toml found, using defaults");
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        let risk = &self.risk;
        for (name, value) in [
            ("risk.max_position_size_percent", risk.max_position_size_percent),
            ("risk.max_daily_loss_percent", risk.max_daily_loss_percent),
            ("risk.max_drawdown_percent", risk.max_drawdown_percent),
            ("risk.max_symbol_concentration_percent", risk.max_symbol_concentration_percent),
            ("risk.position_risk_limit_percent", risk.position_risk_limit_percent),
        ] {
            if value <= Decimal::ZERO {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if self.app.initial_balance < Decimal::ZERO {
            return Err(Error::Config("app.initial_balance must not be negative".into()));
        }
        if self.orders.poll_interval_ms == 0 {
            return Err(Error::Config("orders.poll_interval_ms must be positive".into()));
        }
        let fraction = self.engine.sizing_fraction;
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(Error::Config("engine.sizing_fraction must be in (0, 1]".into()));
        }
        if self.emergency.max_attempts == 0 {
            return Err(Error::Config("emergency.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.orders.max_retries, 3);
        assert_eq!(config.app.quote_asset, "USDT");
        assert_eq!(config.risk.max_same_side_positions, 3);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [risk]
            max_position_size_percent = 5.0
            max_drawdown_percent = 10.0

            [orders]
            poll_interval_ms = 250
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.risk.max_position_size_percent, Decimal::from(5));
        assert_eq!(config.risk.max_drawdown_percent, Decimal::from(10));
        assert_eq!(config.risk.max_daily_loss_percent, Decimal::from(5));
        assert_eq!(config.orders.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.orders.max_retries, 5);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config = Config::from_toml(include_str!("../config.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(config.app.initial_balance, defaults.app.initial_balance);
        assert_eq!(config.risk.max_drawdown_percent, defaults.risk.max_drawdown_percent);
        assert_eq!(config.alerts.position_loss_percent, defaults.alerts.position_loss_percent);
        assert_eq!(config.orders.default_expiry(), None);
        assert_eq!(config.engine.sizing_fraction, defaults.engine.sizing_fraction);
    }

    #[test]
    fn test_rejects_out_of_range_sizing_fraction() {
        assert!(Config::from_toml("[engine]\nsizing_fraction = 1.5\n").is_err());
    }

    #[test]
    fn test_rejects_non_positive_limits() {
        let err = Config::from_toml("[risk]\nmax_drawdown_percent = 0.0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
