use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use crate::config::ExchangeConfig;
use crate::error::{Error, Result};
use crate::exchange::http::{self, HttpTransport};
use crate::exchange::{page_windows, ExchangeClient, RawCandle};
use crate::observability::tracing::trace_fetch;
use crate::rate_limit::RateLimiter;
use crate::types::{Exchange, Interval};
use tracing::Instrument;

const KLINE_PATH: &str = "/api/v3/klines";

// Binance error code for request-weight exhaustion
const TOO_MANY_REQUESTS: i64 = -1003;

pub fn binance_interval(interval: Interval) -> Option<&'static str> {
    Some(match interval {
        Interval::M1 => "1m",
        Interval::M3 => "3m",
        Interval::M5 => "5m",
        Interval::M15 => "15m",
        Interval::M30 => "30m",
        Interval::H1 => "1h",
        Interval::H2 => "2h",
        Interval::H4 => "4h",
        Interval::H6 => "6h",
        Interval::H8 => "8h",
        Interval::H12 => "12h",
        Interval::D1 => "1d",
        Interval::W1 => "1w",
    })
}

/// Binance spot market data client.
///
/// Klines are bare arrays, oldest first:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume, trades, ...]`.
/// Throttling is signalled with HTTP 429 (418 once the IP is banned) and a
/// `Retry-After` header in seconds.
pub struct BinanceClient {
    transport: HttpTransport,
    page_size: u32,
}

impl BinanceClient {
    pub fn new(config: &ExchangeConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        Ok(BinanceClient {
            transport: HttpTransport::new(Exchange::Binance, config, limiter)?,
            page_size: config.page_size,
        })
    }

    async fn fetch_page(
        &self,
        symbol: &str,
        interval_code: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Vec<serde_json::Value>>> {
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", interval_code.to_string()),
            ("startTime", start.timestamp_millis().to_string()),
            ("endTime", (end.timestamp_millis() - 1).to_string()),
            ("limit", self.page_size.to_string()),
        ];

        let response = self.transport.get(KLINE_PATH, &query).await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(Error::RateLimitExceeded {
                retry_after: http::retry_after_secs(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(Error::ExchangeUnavailable(format!("Binance returned {}", status)));
        }
        if !status.is_success() {
            let retry_after = http::retry_after_secs(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<BinanceError>(&body) {
                Ok(error) if error.code == TOO_MANY_REQUESTS => Error::RateLimitExceeded { retry_after },
                Ok(error) => Error::InvalidRequest(format!(
                    "Binance rejected {} {}: {} ({})",
                    symbol, interval_code, error.msg, error.code
                )),
                Err(_) => Error::InvalidRequest(format!(
                    "Binance returned {}: {}",
                    status,
                    http::truncate(&body, 200)
                )),
            });
        }

        http::decode_body(response).await
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawCandle>> {
        let interval_code = binance_interval(interval).ok_or_else(|| {
            Error::InvalidConfiguration(format!("Binance does not offer {} candles", interval))
        })?;

        let mut candles = Vec::new();
        for (start, end) in page_windows(interval, self.page_size, from, to) {
            let page = self.fetch_page(symbol, interval_code, start, end)
                .instrument(trace_fetch(Exchange::Binance, symbol, interval))
                .await?;

            candles.extend(page.into_iter().map(|fields| RawCandle {
                exchange: Exchange::Binance,
                symbol: symbol.to_string(),
                interval,
                fields,
            }));
        }
        Ok(candles)
    }
}

#[derive(Debug, Deserialize)]
struct BinanceError {
    code: i64,
    #[serde(default)]
    msg: String,
}
