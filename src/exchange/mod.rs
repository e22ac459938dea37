pub mod binance;
pub mod bybit;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use crate::config::{AppConfig, ExchangeConfig};
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::types::{Exchange, Interval};

pub use binance::BinanceClient;
pub use bybit::BybitClient;

/// One kline exactly as the exchange sent it, tagged with what was requested.
///
/// `fields` keeps the exchange's positional array untouched; turning it into a
/// [`CandleRecord`](crate::types::CandleRecord) is the normalizer's job.
#[derive(Clone, Debug, PartialEq)]
pub struct RawCandle {
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: Interval,
    pub fields: Vec<serde_json::Value>,
}

/// Candlestick source for one exchange.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn supports(&self, interval: Interval) -> bool {
        supports_interval(self.exchange(), interval)
    }

    /// Fetch every candle with `from <= open_time < to`, oldest first.
    ///
    /// Wide ranges are split into pages; each page waits on the rate limiter
    /// before it is requested.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawCandle>>;
}

pub fn supports_interval(exchange: Exchange, interval: Interval) -> bool {
    match exchange {
        Exchange::Bybit => bybit::bybit_interval(interval).is_some(),
        Exchange::Binance => binance::binance_interval(interval).is_some(),
    }
}

pub fn build_client(
    exchange: Exchange,
    config: &ExchangeConfig,
    limiter: Arc<RateLimiter>,
) -> Result<Arc<dyn ExchangeClient>> {
    Ok(match exchange {
        Exchange::Bybit => Arc::new(BybitClient::new(config, limiter)?),
        Exchange::Binance => Arc::new(BinanceClient::new(config, limiter)?),
    })
}

/// One client per exchange referenced by a task.
pub fn build_clients(
    config: &AppConfig,
    limiter: Arc<RateLimiter>,
) -> Result<HashMap<Exchange, Arc<dyn ExchangeClient>>> {
    config.active_exchanges()
        .into_iter()
        .map(|exchange| {
            let client = build_client(exchange, &config.exchange(exchange), Arc::clone(&limiter))?;
            Ok((exchange, client))
        })
        .collect()
}

/// Split `[from, to)` into consecutive windows of at most `page_size` candles.
pub(crate) fn page_windows(
    interval: Interval,
    page_size: u32,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let span = interval.duration() * page_size.max(1) as i32;
    let mut windows = Vec::new();
    let mut start = from;
    while start < to {
        let end = (start + span).min(to);
        windows.push((start, end));
        start = end;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn windows_cover_range_without_overlap() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = from + Interval::H1.duration() * 25;
        let windows = page_windows(Interval::H1, 10, from, to);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].0, from);
        assert_eq!(windows[2].1, to);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn empty_range_has_no_windows() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(page_windows(Interval::M1, 1000, at, at).is_empty());
    }

    #[test]
    fn eight_hour_candles_are_binance_only() {
        assert!(supports_interval(Exchange::Binance, Interval::H8));
        assert!(!supports_interval(Exchange::Bybit, Interval::H8));
        assert!(supports_interval(Exchange::Bybit, Interval::W1));
    }
}
