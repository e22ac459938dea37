use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::types::Exchange;

/// Fixed-window request budget published by an exchange.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests: 10,
            window_secs: 1,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub page_size: u32,
    /// Bybit market category ("spot" or "linear"); ignored by other exchanges.
    pub category: String,
    /// Overrides the exchange's published budget when set.
    pub rate_limit: Option<RateLimitConfig>,
}

impl ExchangeConfig {
    pub fn rate_limit(&self, exchange: Exchange) -> RateLimitConfig {
        self.rate_limit.clone().unwrap_or_else(|| match exchange {
            Exchange::Bybit => RateLimitConfig { max_requests: 10, window_secs: 1 },
            Exchange::Binance => RateLimitConfig { max_requests: 20, window_secs: 1 },
        })
    }

    pub fn base_url(&self, exchange: Exchange) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| exchange.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            base_url: None,
            timeout_secs: 30,
            page_size: 1000,  // both exchanges cap klines pages at 1000
            category: "spot".to_string(),
            rate_limit: None,
        }
    }
}
