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

const KLINE_PATH: &str = "/v5/market/kline";

// Bybit v5 return codes
const RET_OK: i64 = 0;
const RET_INVALID_PARAMS: i64 = 10001;
const RET_TOO_MANY_VISITS: i64 = 10006;
const RET_IP_BANNED: i64 = 10018;

/// Bybit's kline interval code. Bybit has no 8h candles.
pub fn bybit_interval(interval: Interval) -> Option<&'static str> {
    match interval {
        Interval::M1 => Some("1"),
        Interval::M3 => Some("3"),
        Interval::M5 => Some("5"),
        Interval::M15 => Some("15"),
        Interval::M30 => Some("30"),
        Interval::H1 => Some("60"),
        Interval::H2 => Some("120"),
        Interval::H4 => Some("240"),
        Interval::H6 => Some("360"),
        Interval::H8 => None,
        Interval::H12 => Some("720"),
        Interval::D1 => Some("D"),
        Interval::W1 => Some("W"),
    }
}

/// Bybit v5 market data client.
///
/// Klines come back as `[startTime, open, high, low, close, volume, turnover]`
/// string arrays, newest first, wrapped in a `retCode` envelope.
pub struct BybitClient {
    transport: HttpTransport,
    category: String,
    page_size: u32,
}

impl BybitClient {
    pub fn new(config: &ExchangeConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        Ok(BybitClient {
            transport: HttpTransport::new(Exchange::Bybit, config, limiter)?,
            category: config.category.clone(),
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
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
            ("interval", interval_code.to_string()),
            ("start", start.timestamp_millis().to_string()),
            // inclusive on Bybit's side
            ("end", (end.timestamp_millis() - 1).to_string()),
            ("limit", self.page_size.to_string()),
        ];

        let response = self.transport.get(KLINE_PATH, &query).await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimitExceeded {
                retry_after: http::retry_after_reset_ms(
                    &headers,
                    "x-bapi-limit-reset-timestamp",
                    Utc::now(),
                ),
            });
        }
        if status.is_server_error() {
            return Err(Error::ExchangeUnavailable(format!("Bybit returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidRequest(format!(
                "Bybit returned {}: {}",
                status,
                http::truncate(&body, 200)
            )));
        }

        if let Some(limit) = http::header_u32(&headers, "x-bapi-limit") {
            self.transport.limiter().adjust_limit(Exchange::Bybit, limit).await;
        }

        let envelope: BybitEnvelope = http::decode_body(response).await?;
        match envelope.ret_code {
            RET_OK => {}
            RET_INVALID_PARAMS => {
                return Err(Error::InvalidRequest(format!(
                    "Bybit rejected {} {}: {}",
                    symbol, interval_code, envelope.ret_msg
                )));
            }
            RET_TOO_MANY_VISITS | RET_IP_BANNED => {
                return Err(Error::RateLimitExceeded {
                    retry_after: http::retry_after_reset_ms(
                        &headers,
                        "x-bapi-limit-reset-timestamp",
                        Utc::now(),
                    ),
                });
            }
            code => {
                return Err(Error::ExchangeUnavailable(format!(
                    "Bybit retCode {}: {}",
                    code, envelope.ret_msg
                )));
            }
        }

        let mut list = envelope.result.map(|r| r.list).unwrap_or_default();
        list.reverse();
        Ok(list)
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawCandle>> {
        let interval_code = bybit_interval(interval).ok_or_else(|| {
            Error::InvalidConfiguration(format!("Bybit does not offer {} candles", interval))
        })?;

        let mut candles = Vec::new();
        for (start, end) in page_windows(interval, self.page_size, from, to) {
            let page = self.fetch_page(symbol, interval_code, start, end)
                .instrument(trace_fetch(Exchange::Bybit, symbol, interval))
                .await?;

            candles.extend(page.into_iter().map(|fields| RawCandle {
                exchange: Exchange::Bybit,
                symbol: symbol.to_string(),
                interval,
                fields,
            }));
        }
        Ok(candles)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitEnvelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<BybitKlineResult>,
}

#[derive(Debug, Deserialize)]
struct BybitKlineResult {
    #[serde(default)]
    list: Vec<Vec<serde_json::Value>>,
}
