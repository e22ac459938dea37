use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Response;
use std::sync::Arc;
use std::time::Duration;
use crate::config::ExchangeConfig;
use crate::error::{Error, Result};
use crate::observability::metrics::FETCH_REQUESTS;
use crate::rate_limit::RateLimiter;
use crate::types::Exchange;

/// Rate-limited GET transport shared by the exchange clients.
pub struct HttpTransport {
    exchange: Exchange,
    client: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl HttpTransport {
    pub fn new(exchange: Exchange, config: &ExchangeConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(HttpTransport {
            exchange,
            client,
            base_url: config.base_url(exchange),
            limiter,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Wait for a rate limit slot, then issue the request. Network failures and
    /// timeouts surface as `ExchangeUnavailable`; the status is left to the caller.
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        self.limiter.acquire(self.exchange).await?;
        FETCH_REQUESTS.with_label_values(&[self.exchange.as_str()]).inc();

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {} {:?}", url, query);

        let response = self.client
            .get(&url)
            .query(query)
            .send()
            .await?;
        Ok(response)
    }
}

/// Read the body and decode it, classifying failures as a malformed response.
pub async fn decode_body<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        Error::MalformedResponse(format!("{}: {}", e, truncate(&body, 200)))
    })
}

/// `Retry-After` expressed in seconds.
pub fn retry_after_secs(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, "retry-after")?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Wait until an absolute reset time given in epoch milliseconds.
pub fn retry_after_reset_ms(headers: &HeaderMap, name: &str, now: DateTime<Utc>) -> Option<Duration> {
    let reset_ms = header_str(headers, name)?.trim().parse::<i64>().ok()?;
    let wait_ms = reset_ms - now.timestamp_millis();
    (wait_ms > 0).then(|| Duration::from_millis(wait_ms as u64))
}

pub fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name)?.trim().parse().ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
