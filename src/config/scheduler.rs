use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    /// Consecutive retryable failures tolerated before a task is FAILED.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Upper bound on candles requested per cycle.
    pub batch_limit: u32,
    /// Start point for tasks with neither a stored cursor nor `backfill_from`.
    pub default_lookback_days: u32,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            poll_interval_secs: 60,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            batch_limit: 1_000,
            default_lookback_days: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub timeout_secs: u64,
    /// Consecutive failed checks after which a task is FAILED.
    pub max_failures: u32,
    /// Host resolved to tell a dead resolver from a dead exchange.
    pub dns_check_host: String,
    /// `host:port` endpoints dialled to confirm general internet access.
    pub internet_hosts: Vec<String>,
}

impl ConnectivityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        ConnectivityConfig {
            timeout_secs: 5,
            max_failures: 5,
            dns_check_host: "google.com".to_string(),
            internet_hosts: vec![
                "8.8.8.8:53".to_string(),
                "1.1.1.1:53".to_string(),
                "208.67.222.222:53".to_string(),
            ],
        }
    }
}
