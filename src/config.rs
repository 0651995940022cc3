use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::strategy::decision::{Locale, RiskAppetite};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub market: MarketConfig,
    pub binance: BinanceConfig,
    pub coingecko: CoinGeckoConfig,
    pub rate_limit: RateLimitConfig,
    pub strategy: StrategyConfig,
    pub alerts: AlertsConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Where `PUT /api/config` writes the runtime config.
    pub runtime_config_path: PathBuf,
    pub cors_origins: Vec<String>,
}

/// Startup defaults for the runtime config served at `/api/config`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    pub update_interval_ms: u64,
    pub deviation_threshold: f64,
    pub assets: Vec<String>,
    pub fiat_currency: String,
    pub countries: Vec<String>,
    pub payment_methods: Vec<String>,
    pub filter_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceConfig {
    pub p2p_url: String,
    pub spot_base_url: String,
    pub timeout_ms: u64,
    pub user_agent: String,
    pub top_n: usize,
    pub direction_delay_ms: u64,
    pub search_max_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinGeckoConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
    pub backoff_floor_ms: u64,
    pub spot_backoff_ceiling_ms: u64,
    pub trend_backoff_ceiling_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub risk_appetite: RiskAppetite,
    pub locale: Locale,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    pub discord_enabled: bool,
    /// VND below the previous top-1 price that triggers an alert.
    pub spread_buy: f64,
    pub throttle_seconds: u64,
    pub state_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
}

/// Secrets loaded exclusively from environment variables.
/// Not serializable, not stored in config files.
pub struct Secrets {
    pub discord_webhook_url: Option<SecretString>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(SecretString::from),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, then overlay the deployment
    /// environment variables. `.env` is read first if present.
    pub fn load(path: Option<&Path>) -> Result<(Self, Secrets)> {
        dotenvy::dotenv().ok();

        let config_path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.apply_env_overrides(|key| std::env::var(key).ok());

        let secrets = Secrets::from_env();

        Ok((config, secrets))
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply the environment overrides the dashboard has always honoured.
    /// Unparseable values are ignored and the file value is kept.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(ms) = lookup("UPDATE_INTERVAL").and_then(|v| v.parse().ok()) {
            self.market.update_interval_ms = ms;
        }
        if let Some(threshold) = lookup("DEVIATION_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.market.deviation_threshold = threshold;
        }
        if let Some(asset) = lookup("DEFAULT_ASSET").filter(|v| !v.is_empty()) {
            self.market.assets = vec![asset];
        }
        if let Some(fiat) = lookup("DEFAULT_FIAT").filter(|v| !v.is_empty()) {
            self.market.fiat_currency = fiat;
        }
        if let Some(countries) = lookup("DEFAULT_COUNTRIES") {
            self.market.countries = split_list(&countries);
        }
        if let Some(methods) = lookup("DEFAULT_PAYMENT_METHODS") {
            self.market.payment_methods = split_list(&methods);
        }
        if let Some(ms) = lookup("API_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.binance.timeout_ms = ms;
        }
        if let Some(url) = lookup("BINANCE_API_URL").filter(|v| !v.is_empty()) {
            self.binance.p2p_url = url;
        }
    }

    pub fn default_asset(&self) -> &str {
        self.market.assets.first().map(String::as_str).unwrap_or("USDT")
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Process-wide settings exposed at `/api/config` and adjustable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub deviation_threshold: f64,
    pub update_interval: u64,
    pub assets: Vec<String>,
    pub fiat_currency: String,
    pub countries: Vec<String>,
    pub payment_methods: Vec<String>,
    pub is_filter_enabled: bool,
    pub risk_appetite: RiskAppetite,
}

impl RuntimeConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            deviation_threshold: config.market.deviation_threshold,
            update_interval: config.market.update_interval_ms,
            assets: config.market.assets.clone(),
            fiat_currency: config.market.fiat_currency.clone(),
            countries: config.market.countries.clone(),
            payment_methods: config.market.payment_methods.clone(),
            is_filter_enabled: config.market.filter_enabled,
            risk_appetite: config.strategy.risk_appetite,
        }
    }

    /// Startup defaults, replaced by the persisted runtime file when one
    /// exists and parses.
    pub fn load_or_default(config: &AppConfig) -> Self {
        let path = &config.server.runtime_config_path;
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RuntimeConfig>(&contents) {
                Ok(runtime) => {
                    tracing::info!(path = %path.display(), "Loaded persisted runtime config");
                    runtime
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable runtime config");
                    Self::from_app_config(config)
                }
            },
            Err(_) => Self::from_app_config(config),
        }
    }

    pub fn default_asset(&self) -> &str {
        self.assets.first().map(String::as_str).unwrap_or("USDT")
    }

    /// Best-effort save. Failure is logged, never surfaced to the caller.
    pub async fn persist(&self, path: &Path) {
        if let Err(e) = write_json_file(path, self).await {
            tracing::warn!(path = %path.display(), error = %e, "Could not save runtime config");
        }
    }
}

/// Pretty-print `value` to `path`, creating parent directories.
pub(crate) async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Validated body of `PUT /api/config`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfigUpdate {
    pub deviation_threshold: Option<f64>,
    pub is_filter_enabled: Option<bool>,
    pub risk_appetite: Option<RiskAppetite>,
}

impl RuntimeConfigUpdate {
    /// Accepts numbers or numeric strings for the threshold. An empty body, or
    /// any field with the wrong shape, is rejected with a client-facing message.
    pub fn from_json(body: &serde_json::Value) -> std::result::Result<Self, String> {
        let mut update = Self::default();

        match body.get("deviationThreshold") {
            None | Some(serde_json::Value::Null) => {}
            Some(value) => {
                let threshold = match value {
                    serde_json::Value::Number(n) => n.as_f64(),
                    serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .filter(|t| t.is_finite() && *t >= 0.0)
                .ok_or_else(|| "Invalid deviationThreshold value".to_string())?;
                update.deviation_threshold = Some(threshold);
            }
        }

        if let Some(value) = body.get("isFilterEnabled").filter(|v| !v.is_null()) {
            let enabled = value
                .as_bool()
                .ok_or_else(|| "Invalid isFilterEnabled value".to_string())?;
            update.is_filter_enabled = Some(enabled);
        }

        if let Some(value) = body.get("riskAppetite").filter(|v| !v.is_null()) {
            let appetite = value
                .as_str()
                .and_then(|s| s.parse::<RiskAppetite>().ok())
                .ok_or_else(|| "Invalid riskAppetite value".to_string())?;
            update.risk_appetite = Some(appetite);
        }

        if update == Self::default() {
            return Err("Invalid deviationThreshold value".to_string());
        }
        Ok(update)
    }

    pub fn apply(&self, runtime: &mut RuntimeConfig) {
        if let Some(t) = self.deviation_threshold {
            runtime.deviation_threshold = t;
        }
        if let Some(enabled) = self.is_filter_enabled {
            runtime.is_filter_enabled = enabled;
        }
        if let Some(appetite) = self.risk_appetite {
            runtime.risk_appetite = appetite;
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig::from_toml(include_str!("../config/default.toml")).expect("default config should parse")
}
