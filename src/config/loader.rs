use std::collections::{HashMap, HashSet};
use crate::config::*;
use crate::error::{Error, Result};
use crate::exchange::supports_interval;
use crate::types::{Exchange, TaskKey};
use config::{Config, Environment, File};
use serde::Deserialize;

const MAX_BATCH_LIMIT: u32 = 100_000;
const MAX_LOOKBACK_DAYS: u32 = 36_500;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load `path` (any format the `config` crate recognises by extension) and
    /// overlay `CANDLE_INGEST__SECTION__KEY` environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("CANDLE_INGEST").separator("__"))
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let app: AppConfig = config.try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let app: AppConfig = toml::from_str(raw)
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.exchanges.keys() {
            name.parse::<Exchange>().map_err(Error::InvalidConfiguration)?;
        }

        if self.tasks.is_empty() {
            return Err(Error::InvalidConfiguration("no ingestion tasks configured".into()));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.symbol.trim().is_empty()
                || !task.symbol.trim().chars().all(|c| c.is_ascii_alphanumeric())
            {
                return Err(Error::InvalidConfiguration(format!(
                    "invalid symbol {:?} for {}",
                    task.symbol, task.exchange
                )));
            }

            if !self.exchanges.contains_key(task.exchange.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "task {} references unconfigured exchange {}",
                    task.key(),
                    task.exchange
                )));
            }

            if !supports_interval(task.exchange, task.interval) {
                return Err(Error::InvalidConfiguration(format!(
                    "{} does not offer {} candles",
                    task.exchange, task.interval
                )));
            }

            if !seen.insert(task.key()) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicate task {}",
                    task.key()
                )));
            }
        }

        for (name, exchange) in &self.exchanges {
            let budget = exchange.rate_limit.clone().unwrap_or_default();
            if budget.max_requests == 0 || budget.window_secs == 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "{}: rate limit budget must be non-zero",
                    name
                )));
            }
            if exchange.page_size == 0 || exchange.page_size > 1000 {
                return Err(Error::InvalidConfiguration(format!(
                    "{}: page_size must be within 1..=1000, got {}",
                    name, exchange.page_size
                )));
            }
        }

        let scheduler = &self.scheduler;
        if scheduler.backoff_base_ms == 0 || scheduler.backoff_cap_ms < scheduler.backoff_base_ms {
            return Err(Error::InvalidConfiguration(
                "backoff_cap_ms must be >= backoff_base_ms > 0".into(),
            ));
        }
        if scheduler.batch_limit == 0 || scheduler.batch_limit > MAX_BATCH_LIMIT {
            return Err(Error::InvalidConfiguration(format!(
                "batch_limit must be within 1..={}, got {}",
                MAX_BATCH_LIMIT, scheduler.batch_limit
            )));
        }

        if scheduler.default_lookback_days == 0 || scheduler.default_lookback_days > MAX_LOOKBACK_DAYS {
            return Err(Error::InvalidConfiguration(format!(
                "default_lookback_days must be within 1..={}, got {}",
                MAX_LOOKBACK_DAYS, scheduler.default_lookback_days
            )));
        }

        let connectivity = &self.connectivity;
        if connectivity.timeout_secs == 0 || connectivity.max_failures == 0 {
            return Err(Error::InvalidConfiguration(
                "connectivity timeout_secs and max_failures must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// Settings for `exchange`, falling back to its published defaults.
    pub fn exchange(&self, exchange: Exchange) -> ExchangeConfig {
        self.exchanges
            .get(exchange.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Exchanges referenced by at least one task.
    pub fn active_exchanges(&self) -> Vec<Exchange> {
        let mut exchanges: Vec<Exchange> = self.tasks.iter().map(|t| t.exchange).collect();
        exchanges.sort();
        exchanges.dedup();
        exchanges
    }

    pub fn task_keys(&self) -> Vec<TaskKey> {
        self.tasks.iter().map(TaskConfig::key).collect()
    }
}
