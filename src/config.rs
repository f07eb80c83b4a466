use std::time::Duration;

use ::config::builder::DefaultState;
use ::config::{ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::api::KRAKEN_API_BASE;
use crate::error::{Error, Result};
use crate::retention::RetentionPolicy;
use crate::strategy::SwingParams;

const CONFIG_FILE: &str = "swingbot";
const ENV_PREFIX: &str = "SWINGBOT";
const MIN_FETCH_INTERVAL_SECS: u64 = 5;

/// Runtime configuration.
///
/// Layers, lowest first: built-in defaults, optional `swingbot.toml`,
/// `SWINGBOT__SECTION__KEY` variables, then the plain variables
/// (`DATABASE_URL`, `RETENTION_FULL_DAYS`, `FETCH_INTERVAL_SEC`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub retention: RetentionPolicy,
    pub fetch: FetchConfig,
    pub strategy: SwingParams,
    pub simulation: SimulationConfig,
    pub kraken: KrakenConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    pub interval_secs: u64,
    /// Run one pass immediately instead of waiting a full interval
    pub on_start: bool,
}

impl FetchConfig {
    /// Interval between passes, floored at 5 seconds
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_FETCH_INTERVAL_SECS))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Most recent candles replayed per pair
    pub candles: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KrakenConfig {
    pub base_url: String,
}

impl AppConfig {
    /// Load the optional config file and the environment.
    /// `.env` is read by the caller before logging starts.
    pub fn load() -> Result<Self> {
        let builder = Self::defaults()?
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("database_url", env("DATABASE_URL"))?
            .set_override_option("retention.full_days", env("RETENTION_FULL_DAYS"))?
            .set_override_option("retention.half_days", env("RETENTION_HALF_DAYS"))?
            .set_override_option("retention.sixth_days", env("RETENTION_SIXTH_DAYS"))?
            .set_override_option("fetch.interval_secs", env("FETCH_INTERVAL_SEC"))?
            .set_override_option("fetch.on_start", env("FETCH_ON_START"))?;

        Self::from_builder(builder)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let retention = RetentionPolicy::default();
        let strategy = SwingParams::default();

        Ok(::config::Config::builder()
            .set_default("database_url", "sqlite://data.db")?
            .set_default("retention.full_days", i64::from(retention.full_days))?
            .set_default("retention.half_days", i64::from(retention.half_days))?
            .set_default("retention.sixth_days", i64::from(retention.sixth_days))?
            .set_default("fetch.interval_secs", 300)?
            .set_default("fetch.on_start", true)?
            .set_default("strategy.ma_short", strategy.ma_short as i64)?
            .set_default("strategy.ma_long", strategy.ma_long as i64)?
            .set_default("strategy.lookback", strategy.lookback as i64)?
            .set_default("simulation.candles", 1000)?
            .set_default("kraken.base_url", KRAKEN_API_BASE)?)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.retention.validate()?;

        if self.strategy.ma_short == 0 || self.strategy.ma_long == 0 {
            return Err(Error::Validation(
                "strategy.ma_short and strategy.ma_long must be at least 1".to_string(),
            ));
        }
        if self.strategy.lookback < self.strategy.min_candles() {
            return Err(Error::Validation(format!(
                "strategy.lookback ({}) must cover max(ma_short, ma_long) + 1 = {} candles",
                self.strategy.lookback,
                self.strategy.min_candles()
            )));
        }
        if self.simulation.candles <= 0 {
            return Err(Error::Validation(
                "simulation.candles must be positive".to_string(),
            ));
        }
        if self.fetch.interval_secs < MIN_FETCH_INTERVAL_SECS {
            tracing::warn!(
                "fetch.interval_secs={} is below the minimum, using {}s",
                self.fetch.interval_secs,
                MIN_FETCH_INTERVAL_SECS
            );
        }

        Ok(())
    }

    /// Log the effective configuration
    pub fn log_summary(&self) {
        tracing::info!("📊 Configuration:");
        tracing::info!("  Database: {}", self.database_url);
        tracing::info!(
            "  Retention (days): full={} half={} sixth={}",
            self.retention.full_days,
            self.retention.half_days,
            self.retention.sixth_days
        );
        tracing::info!(
            "  Fetch: every {}s (on start: {})",
            self.fetch.interval().as_secs(),
            self.fetch.on_start
        );
        tracing::info!(
            "  Strategy: MA{}/MA{} lookback={}",
            self.strategy.ma_short,
            self.strategy.ma_long,
            self.strategy.lookback
        );
        tracing::debug!("  Simulation candles: {}", self.simulation.candles);
        tracing::debug!("  Kraken: {}", self.kraken.base_url);
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
