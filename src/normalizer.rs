use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use crate::error::{Error, Result};
use crate::exchange::RawCandle;
use crate::types::{CandleRecord, Exchange};

// Epoch values below this are seconds; above the upper bound, microseconds.
const SECONDS_CEILING: i64 = 100_000_000_000;
const MICROS_FLOOR: i64 = 100_000_000_000_000;

/// Position of each OHLCV field in an exchange's kline array.
struct FieldLayout {
    open_time: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
}

fn layout(exchange: Exchange) -> FieldLayout {
    match exchange {
        // [startTime, open, high, low, close, volume, turnover]
        Exchange::Bybit => FieldLayout { open_time: 0, open: 1, high: 2, low: 3, close: 4, volume: 5 },
        // [openTime, open, high, low, close, volume, closeTime, ...]
        Exchange::Binance => FieldLayout { open_time: 0, open: 1, high: 2, low: 3, close: 4, volume: 5 },
    }
}

/// Maps raw exchange klines onto [`CandleRecord`].
///
/// Stateless. Accepts prices as JSON strings or numbers and open times in
/// seconds, milliseconds or microseconds. A missing volume reads as zero;
/// a missing price or time is an error.
pub struct RecordNormalizer;

impl RecordNormalizer {
    pub fn normalize(raw: &RawCandle) -> Result<CandleRecord> {
        let layout = layout(raw.exchange);
        let field = |index: usize| raw.fields.get(index).filter(|v| !v.is_null());

        let open_time = field(layout.open_time)
            .ok_or_else(|| invalid(raw, "missing open time"))
            .and_then(|v| parse_open_time(raw, v))?;

        if !raw.interval.is_aligned(open_time) {
            return Err(invalid(raw, &format!(
                "open time {} is not on a {} boundary",
                open_time, raw.interval
            )));
        }

        let price = |index: usize, name: &str| -> Result<Decimal> {
            let value = field(index).ok_or_else(|| invalid(raw, &format!("missing {}", name)))?;
            parse_decimal(raw, name, value)
        };

        let open = price(layout.open, "open")?;
        let high = price(layout.high, "high")?;
        let low = price(layout.low, "low")?;
        let close = price(layout.close, "close")?;
        let volume = match field(layout.volume) {
            Some(value) => parse_decimal(raw, "volume", value)?,
            None => Decimal::ZERO,
        };

        if [open, high, low, close, volume].iter().any(|v| v.is_sign_negative() && !v.is_zero()) {
            return Err(invalid(raw, "negative price or volume"));
        }
        if high < low {
            return Err(invalid(raw, &format!("high {} below low {}", high, low)));
        }

        Ok(CandleRecord {
            exchange: raw.exchange,
            symbol: raw.symbol.trim().to_uppercase(),
            interval: raw.interval,
            open_time,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Normalize a fetched range. The result is sorted by open time with
    /// repeated open times collapsed, so overlapping pages are harmless.
    pub fn normalize_batch(raws: &[RawCandle]) -> Result<Vec<CandleRecord>> {
        let mut records = raws.iter()
            .map(RecordNormalizer::normalize)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.open_time);
        records.dedup_by_key(|r| r.open_time);
        Ok(records)
    }
}

fn parse_open_time(raw: &RawCandle, value: &Value) -> Result<DateTime<Utc>> {
    let epoch = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(raw, &format!("unreadable open time {}", value)))?;

    let millis = if epoch.abs() < SECONDS_CEILING {
        epoch.checked_mul(1000)
    } else if epoch.abs() >= MICROS_FLOOR {
        Some(epoch / 1000)
    } else {
        Some(epoch)
    };

    millis
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| invalid(raw, &format!("open time {} out of range", epoch)))
}

fn parse_decimal(raw: &RawCandle, name: &str, value: &Value) -> Result<Decimal> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => return Err(invalid(raw, &format!("{} is not numeric: {}", name, other))),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| invalid(raw, &format!("{} is not numeric: {:?}", name, text)))
}

fn invalid(raw: &RawCandle, reason: &str) -> Error {
    Error::NormalizationError(format!(
        "{} {} {}: {}",
        raw.exchange, raw.symbol, raw.interval, reason
    ))
}
