use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use crate::types::exchange::Exchange;
use crate::types::ids::TaskKey;
use crate::types::interval::Interval;

/// Canonical OHLCV candle as persisted in the `candles` table.
///
/// `(exchange, symbol, interval, open_time)` identifies a row. Records are
/// insert-only; a stored candle is never rewritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl CandleRecord {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            exchange: self.exchange,
            symbol: self.symbol.clone(),
            interval: self.interval,
        }
    }

    /// Open time of the candle that follows this one.
    pub fn next_open_time(&self) -> DateTime<Utc> {
        self.open_time + self.interval.duration()
    }
}
