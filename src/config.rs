use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub risk: RiskConfig,
    pub scalper: ScalperConfig,
    pub watchdog: WatchdogConfig,
    pub alerts: AlertsConfig,
    pub binance: BinanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub symbols: Vec<String>,
    pub log_level: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub live_mode: bool,
    #[serde(default = "default_hold_limit_hours")]
    pub hold_limit_hours: u64,
}

fn default_hold_limit_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    pub initial_balance: f64,
    pub max_risk_per_trade: f64,
    pub daily_loss_limit_pct: f64,
    pub max_concurrent_positions: usize,
    #[serde(default = "default_consecutive_loss_limit")]
    pub consecutive_loss_limit: u32,
    #[serde(default = "default_symbol_cooldown_minutes")]
    pub symbol_cooldown_minutes: u64,
    #[serde(default = "default_maintenance_margin_rate")]
    pub maintenance_margin_rate: f64,
    pub usd_allocation: HashMap<String, f64>,
    #[serde(default = "default_usd_allocation")]
    pub default_usd_allocation: f64,
}

fn default_consecutive_loss_limit() -> u32 {
    3
}

fn default_symbol_cooldown_minutes() -> u64 {
    30
}

fn default_maintenance_margin_rate() -> f64 {
    0.01
}

fn default_usd_allocation() -> f64 {
    50.0
}

impl RiskConfig {
    pub fn allocation_for(&self, symbol: &str) -> Decimal {
        self.usd_allocation
            .get(symbol)
            .copied()
            .and_then(|v| Decimal::try_from(v).ok())
            .unwrap_or_else(|| Decimal::try_from(self.default_usd_allocation).unwrap_or(Decimal::from(50)))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PartialTpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_first_rr")]
    pub first_rr: f64,
    #[serde(default = "default_first_size_pct")]
    pub first_size_pct: f64,
}

fn default_first_rr() -> f64 {
    1.0
}

fn default_first_size_pct() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScalperConfig {
    pub timeframe: String,
    #[serde(default = "default_min_candles")]
    pub min_candles: usize,
    #[serde(default = "default_swing_sl_lookback")]
    pub swing_sl_lookback: usize,
    pub min_sl_distance_pct: f64,
    pub fallback_sl_pct: f64,
    pub risk_reward_ratio: f64,
    #[serde(default = "default_min_tp_sl_gap_pct")]
    pub min_tp_sl_gap_pct: f64,
    pub leverage: f64,
    pub partial_tp: PartialTpConfig,
    #[serde(default = "default_trail_activation_buffer_pct")]
    pub trail_activation_buffer_pct: f64,
    #[serde(default = "default_trail_distance_pct")]
    pub trail_distance_pct: f64,
}

fn default_min_candles() -> usize {
    50
}

fn default_swing_sl_lookback() -> usize {
    10
}

fn default_min_tp_sl_gap_pct() -> f64 {
    0.001
}

fn default_trail_activation_buffer_pct() -> f64 {
    0.002
}

fn default_trail_distance_pct() -> f64 {
    0.005
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    #[serde(default = "default_heartbeat_timeout_sec")]
    pub heartbeat_timeout_sec: u64,
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_sl_tp_buffer_pct")]
    pub sl_tp_buffer_pct: f64,
    #[serde(default = "default_grace_seconds")]
    pub binance_missing_grace_seconds: i64,
}

fn default_heartbeat_timeout_sec() -> u64 {
    60
}

fn default_poll_interval_sec() -> u64 {
    5
}

fn default_sl_tp_buffer_pct() -> f64 {
    0.001
}

fn default_grace_seconds() -> i64 {
    30
}

impl WatchdogConfig {
    /// Environment variable BINANCE_MISSING_GRACE_SECONDS overrides the config value.
    pub fn grace_seconds(&self) -> i64 {
        std::env::var("BINANCE_MISSING_GRACE_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.binance_missing_grace_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
}

fn default_dedup_ttl_secs() -> u64 {
    60
}

impl AlertsConfig {
    pub fn webhook_url(&self) -> Result<String, String> {
        std::env::var("DISCORD_WEBHOOK_URL")
            .map_err(|_| "DISCORD_WEBHOOK_URL not set in .env file".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BinanceConfig {
    pub api_url: String,
    pub ws_url: String,
    pub max_time_offset_ms: i64,
    pub max_latency_ms: f64,
    pub ping_samples: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub trades_csv_path: String,
    pub lifecycle_csv_path: String,
    pub equity_csv_path: String,
    pub positions_snapshot_path: String,
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.general.symbols.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one symbol must be configured".into(),
            ));
        }
        if self.risk.max_risk_per_trade <= 0.0 || self.risk.max_risk_per_trade > 0.1 {
            return Err(ConfigError::Invalid(
                "max_risk_per_trade must be between 0 and 0.1".into(),
            ));
        }
        if self.risk.daily_loss_limit_pct <= 0.0 || self.risk.daily_loss_limit_pct > 0.5 {
            return Err(ConfigError::Invalid(
                "daily_loss_limit_pct must be between 0 and 0.5".into(),
            ));
        }
        if self.scalper.min_sl_distance_pct <= 0.0 {
            return Err(ConfigError::Invalid(
                "min_sl_distance_pct must be > 0".into(),
            ));
        }
        if self.scalper.risk_reward_ratio <= 0.0 {
            return Err(ConfigError::Invalid(
                "risk_reward_ratio must be > 0".into(),
            ));
        }
        if self.scalper.partial_tp.first_size_pct <= 0.0 || self.scalper.partial_tp.first_size_pct >= 1.0 {
            return Err(ConfigError::Invalid(
                "partial_tp.first_size_pct must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_symbols() {
        let toml_str = r#"
            [general]
            symbols = []
            log_level = "info"
            [risk]
            initial_balance = 1000.0
            max_risk_per_trade = 0.01
            daily_loss_limit_pct = 0.05
            max_concurrent_positions = 3
            usd_allocation = {}
            [scalper]
            timeframe = "5m"
            min_sl_distance_pct = 0.0005
            fallback_sl_pct = 0.003
            risk_reward_ratio = 1.5
            leverage = 10.0
            [scalper.partial_tp]
            enabled = true
            [watchdog]
            [alerts]
            [binance]
            api_url = "https://fapi.binance.com"
            ws_url = "wss://fstream.binance.com"
            max_time_offset_ms = 500
            max_latency_ms = 200.0
            ping_samples = 3
            [logging]
            trades_csv_path = "a.csv"
            lifecycle_csv_path = "b.csv"
            equity_csv_path = "c.csv"
            positions_snapshot_path = "open_positions.json"
        "#;
        let parsed: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(parsed.validate().is_err());
    }
}
