use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use crate::config::{AppConfig, RateLimitConfig};
use crate::error::{Error, Result};
use crate::observability::metrics::RATE_LIMIT_WAITS;
use crate::rate_limit::budget::RateLimitBudget;
use crate::types::Exchange;

/// Paces outbound requests per exchange.
///
/// Each exchange owns one budget behind an async mutex, so every task that
/// targets the same exchange queues on the same lock. The lock is held while
/// a caller waits for the window to reopen, which keeps grants in arrival order.
pub struct RateLimiter {
    budgets: HashMap<Exchange, Arc<Mutex<RateLimitBudget>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            budgets: HashMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        config.active_exchanges()
            .into_iter()
            .fold(RateLimiter::new(), |limiter, exchange| {
                let budget = config.exchange(exchange).rate_limit(exchange);
                limiter.with_budget(exchange, &budget)
            })
    }

    pub fn with_budget(mut self, exchange: Exchange, config: &RateLimitConfig) -> Self {
        let budget = RateLimitBudget::new(
            exchange,
            config.max_requests,
            config.window(),
            Instant::now(),
        );
        self.budgets.insert(exchange, Arc::new(Mutex::new(budget)));
        self
    }

    /// Wait until a request slot for `exchange` is available and take it.
    ///
    /// Returns immediately while the current window has budget left.
    pub async fn acquire(&self, exchange: Exchange) -> Result<()> {
        let budget = self.budgets.get(&exchange).ok_or_else(|| {
            Error::InvalidConfiguration(format!("no rate limit budget for {}", exchange))
        })?;

        let mut budget = budget.lock().await;
        loop {
            match budget.try_acquire(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(retry_at) => {
                    RATE_LIMIT_WAITS.with_label_values(&[exchange.as_str()]).inc();
                    tracing::debug!(
                        "Rate limit budget for {} exhausted, waiting {:?}",
                        exchange,
                        retry_at.saturating_duration_since(Instant::now())
                    );
                    sleep_until(retry_at).await;
                }
            }
        }
    }

    /// Apply a limit advertised by the exchange. Only ever tightens the budget.
    pub async fn adjust_limit(&self, exchange: Exchange, advertised_max: u32) {
        if let Some(budget) = self.budgets.get(&exchange) {
            let mut budget = budget.lock().await;
            if budget.lower_limit(advertised_max) {
                tracing::warn!(
                    "Lowered {} rate limit to {} requests per {:?}",
                    exchange,
                    budget.max_requests_per_window,
                    budget.window
                );
            }
        }
    }

    pub async fn budget(&self, exchange: Exchange) -> Option<RateLimitBudget> {
        match self.budgets.get(&exchange) {
            Some(budget) => Some(budget.lock().await.clone()),
            None => None,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
