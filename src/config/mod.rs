use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::types::{Exchange, Interval, TaskKey};

pub mod exchange;
pub mod scheduler;
pub mod loader;

pub use exchange::{ExchangeConfig, RateLimitConfig};
pub use loader::AppConfig;
pub use scheduler::{ConnectivityConfig, SchedulerConfig};

/// One configured ingestion triple.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TaskConfig {
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: Interval,
    #[serde(default)]
    pub backfill_from: Option<DateTime<Utc>>,
}

impl TaskConfig {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.exchange, &self.symbol, self.interval)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: "sqlite://candles.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}
