use crate::models::FeeSchedule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ACCESS_KEY_VAR: &str = "BITHUMB_ACCESS_KEY";
pub const SECRET_KEY_VAR: &str = "BITHUMB_SECRET_KEY";
const ENV_PREFIX: &str = "SURGEBOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing credential: {0} is not set")]
    MissingCredential(&'static str),
}

/// How every Holding position of a run is exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Ratcheting stop below the highest observed price
    #[default]
    TrailingStop,
    /// Resting limit sell at entry * (1 + profit_ratio)
    TakeProfit,
    /// Market sell on a dead cross
    DeadCross,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VolumeWindows {
    pub short: usize,
    pub long: usize,
    pub short_threshold: f64,
    pub long_threshold: f64,
}

impl Default for VolumeWindows {
    fn default() -> Self {
        Self {
            short: 5,
            long: 60,
            short_threshold: 1.8,
            long_threshold: 1.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaWindows {
    pub short: usize,
    pub long: usize,
}

impl Default for MaWindows {
    fn default() -> Self {
        Self { short: 5, long: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Requests allowed per `rate_limit_interval_ms`
    pub rate_limit: u32,
    pub rate_limit_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bithumb.com".to_string(),
            rate_limit: 100,
            rate_limit_interval_ms: 1000,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_file: String,
    pub max_backups: usize,
    /// When set, snapshots go to Redis instead of the JSON file
    pub redis_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: "bot_data.json".to_string(),
            max_backups: 5,
            redis_url: None,
        }
    }
}

/// Bot configuration
///
/// Loaded from built-in defaults, then an optional TOML file, then
/// `SURGEBOT__*` environment variables (e.g. `SURGEBOT__VOLUME__SHORT=3`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BotConfig {
    /// KRW spent per entry
    pub buy_amount: f64,
    pub min_order_value: f64,
    pub profit_ratio: f64,
    pub loss_ratio: f64,
    pub trailing_ratio: f64,
    /// Minimum relative rise before the trailing stop ratchets
    pub trailing_noise: f64,
    pub buy_fee: f64,
    pub sell_fee: f64,
    pub exit_policy: ExitPolicy,
    pub buy_timeout_secs: u64,
    pub profit_order_delay_secs: u64,
    pub cancel_retries: u32,
    pub cancel_backoff_ms: u64,
    pub max_position_errors: u32,
    pub scan_limit: usize,
    pub cycle_interval_secs: u64,
    /// Candle bucket size in minutes
    pub candle_unit: u32,
    pub volume: VolumeWindows,
    pub moving_average: MaWindows,
    pub api: ApiConfig,
    pub storage: StorageConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            buy_amount: 10_000.0,
            min_order_value: 5_000.0,
            profit_ratio: 0.03,
            loss_ratio: 0.015,
            trailing_ratio: 0.02,
            trailing_noise: 0.001,
            buy_fee: 0.0004,
            sell_fee: 0.0004,
            exit_policy: ExitPolicy::TrailingStop,
            buy_timeout_secs: 120,
            profit_order_delay_secs: 3,
            cancel_retries: 3,
            cancel_backoff_ms: 1000,
            max_position_errors: 3,
            scan_limit: 15,
            cycle_interval_secs: 30,
            candle_unit: 1,
            volume: VolumeWindows::default(),
            moving_average: MaWindows::default(),
            api: ApiConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration, layering the optional file and the environment
    /// over the defaults. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&BotConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let loaded: BotConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("buy_amount", self.buy_amount),
            ("profit_ratio", self.profit_ratio),
            ("loss_ratio", self.loss_ratio),
            ("trailing_ratio", self.trailing_ratio),
            ("volume.short_threshold", self.volume.short_threshold),
            ("volume.long_threshold", self.volume.long_threshold),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        for (name, value) in [
            ("trailing_noise", self.trailing_noise),
            ("buy_fee", self.buy_fee),
            ("sell_fee", self.sell_fee),
            ("min_order_value", self.min_order_value),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Invalid(format!("{} must not be negative", name)));
            }
        }

        if self.loss_ratio >= 1.0 || self.trailing_ratio >= 1.0 {
            return Err(ConfigError::Invalid(
                "loss_ratio and trailing_ratio must be below 1".into(),
            ));
        }

        if self.volume.short == 0 || self.volume.long == 0 {
            return Err(ConfigError::Invalid("volume windows must be non-zero".into()));
        }
        if self.moving_average.short == 0 || self.moving_average.short >= self.moving_average.long
        {
            return Err(ConfigError::Invalid(
                "moving_average.short must be non-zero and below moving_average.long".into(),
            ));
        }
        if self.candle_unit == 0 || self.scan_limit == 0 || self.api.rate_limit == 0 {
            return Err(ConfigError::Invalid(
                "candle_unit, scan_limit and api.rate_limit must be non-zero".into(),
            ));
        }

        Ok(())
    }

    pub fn fees(&self) -> FeeSchedule {
        FeeSchedule {
            buy: self.buy_fee,
            sell: self.sell_fee,
        }
    }

    pub fn buy_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.buy_timeout_secs as i64)
    }

    pub fn profit_order_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.profit_order_delay_secs as i64)
    }

    pub fn cancel_backoff(&self) -> Duration {
        Duration::from_millis(self.cancel_backoff_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

/// Exchange API keys
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &"***")
            .field("secret_key", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_key = std::env::var(ACCESS_KEY_VAR)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingCredential(ACCESS_KEY_VAR))?;
        let secret_key = std::env::var(SECRET_KEY_VAR)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingCredential(SECRET_KEY_VAR))?;

        Ok(Self {
            access_key,
            secret_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.exit_policy, ExitPolicy::TrailingStop);
        assert_eq!(config.volume.short, 5);
        assert_eq!(config.volume.long, 60);
        assert_eq!(config.api.rate_limit, 100);
    }

    #[test]
    fn test_validate_rejects_bad_ratios() {
        let mut config = BotConfig::default();
        config.loss_ratio = 0.0;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.moving_average = MaWindows { short: 20, long: 5 };
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.volume.long = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surgebot.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "buy_amount = 20000.0\nexit_policy = \"take_profit\"\n\n[volume]\nshort = 3"
        )
        .unwrap();

        let config = BotConfig::load(Some(&path)).unwrap();
        assert_eq!(config.buy_amount, 20_000.0);
        assert_eq!(config.exit_policy, ExitPolicy::TakeProfit);
        assert_eq!(config.volume.short, 3);
        // untouched keys keep their defaults
        assert_eq!(config.volume.long, 60);
        assert_eq!(config.storage.max_backups, 5);
    }

    #[test]
    fn test_load_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = BotConfig::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.scan_limit, 15);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials {
            access_key: "abc".into(),
            secret_key: "def".into(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("abc"));
        assert!(!printed.contains("def"));
    }
}
