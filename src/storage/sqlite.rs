use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::storage::{CandleStore, CollectionStats, CursorStore, TaskCursor, TaskStatus};
use crate::types::{CandleRecord, Exchange, Interval, TaskKey};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS candles (
        exchange   TEXT    NOT NULL,
        symbol     TEXT    NOT NULL,
        interval   TEXT    NOT NULL,
        open_time  INTEGER NOT NULL,
        open       TEXT    NOT NULL,
        high       TEXT    NOT NULL,
        low        TEXT    NOT NULL,
        close      TEXT    NOT NULL,
        volume     TEXT    NOT NULL,
        UNIQUE (exchange, symbol, interval, open_time)
    )",
    "CREATE TABLE IF NOT EXISTS ingestion_cursors (
        exchange   TEXT    NOT NULL,
        symbol     TEXT    NOT NULL,
        interval   TEXT    NOT NULL,
        cursor     INTEGER,
        status     TEXT    NOT NULL DEFAULT 'active',
        last_error TEXT,
        updated_at INTEGER,
        PRIMARY KEY (exchange, symbol, interval)
    )",
];

/// SQLite-backed [`CandleStore`] and [`CursorStore`].
///
/// Times are stored as epoch milliseconds and prices as decimal text, so
/// nothing is lost to floating point on the way in or out.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // every connection to an in-memory database sees its own empty copy,
        // and the data is gone once the last connection closes
        let pool = if config.url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        }
        .connect_with(options)
        .await?;

        let store = SqliteStore { pool };
        store.migrate().await?;
        tracing::info!("Connected to candle store at {}", config.url);
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        SqliteStore::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CandleStore for SqliteStore {
    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for record in records {
            let result = sqlx::query(
                "INSERT INTO candles
                    (exchange, symbol, interval, open_time, open, high, low, close, volume)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (exchange, symbol, interval, open_time) DO NOTHING",
            )
            .bind(record.exchange.as_str())
            .bind(&record.symbol)
            .bind(record.interval.as_str())
            .bind(record.open_time.timestamp_millis())
            .bind(record.open.to_string())
            .bind(record.high.to_string())
            .bind(record.low.to_string())
            .bind(record.close.to_string())
            .bind(record.volume.to_string())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn stats(&self) -> Result<Vec<CollectionStats>> {
        let rows = sqlx::query(
            "SELECT exchange, symbol, interval,
                    COUNT(*) AS candles, MIN(open_time) AS earliest, MAX(open_time) AS latest
             FROM candles
             GROUP BY exchange, symbol, interval
             ORDER BY exchange, symbol, interval",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CollectionStats {
                    key: task_key(row)?,
                    candles: row.try_get::<i64, _>("candles")? as u64,
                    earliest: from_millis(row.try_get("earliest")?),
                    latest: from_millis(row.try_get("latest")?),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn load_cursor(&self, key: &TaskKey) -> Result<Option<TaskCursor>> {
        let row = sqlx::query(
            "SELECT exchange, symbol, interval, cursor, status, last_error, updated_at
             FROM ingestion_cursors
             WHERE exchange = ? AND symbol = ? AND interval = ?",
        )
        .bind(key.exchange.as_str())
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_cursor).transpose()
    }

    async fn advance_cursor(&self, key: &TaskKey, cursor: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_cursors (exchange, symbol, interval, cursor, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (exchange, symbol, interval) DO UPDATE SET
                cursor = MAX(COALESCE(cursor, excluded.cursor), excluded.cursor),
                updated_at = excluded.updated_at",
        )
        .bind(key.exchange.as_str())
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .bind(cursor.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rewind_cursor(&self, key: &TaskKey, cursor: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_cursors (exchange, symbol, interval, cursor, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (exchange, symbol, interval) DO UPDATE SET
                cursor = excluded.cursor,
                updated_at = excluded.updated_at",
        )
        .bind(key.exchange.as_str())
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .bind(cursor.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, key: &TaskKey, reason: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_cursors (exchange, symbol, interval, status, last_error, updated_at)
             VALUES (?, ?, ?, 'failed', ?, ?)
             ON CONFLICT (exchange, symbol, interval) DO UPDATE SET
                status = 'failed',
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(key.exchange.as_str())
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_failed(&self, key: &TaskKey) -> Result<()> {
        sqlx::query(
            "UPDATE ingestion_cursors
             SET status = 'active', last_error = NULL, updated_at = ?
             WHERE exchange = ? AND symbol = ? AND interval = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(key.exchange.as_str())
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<(TaskKey, TaskCursor)>> {
        let rows = sqlx::query(
            "SELECT exchange, symbol, interval, cursor, status, last_error, updated_at
             FROM ingestion_cursors
             ORDER BY exchange, symbol, interval",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((task_key(row)?, task_cursor(row)?)))
            .collect()
    }
}

fn task_key(row: &SqliteRow) -> Result<TaskKey> {
    let exchange: String = row.try_get("exchange")?;
    let symbol: String = row.try_get("symbol")?;
    let interval: String = row.try_get("interval")?;

    let exchange = Exchange::from_str(&exchange).map_err(Error::StorageFailure)?;
    let interval = Interval::from_str(&interval).map_err(Error::StorageFailure)?;
    Ok(TaskKey::new(exchange, symbol, interval))
}

fn task_cursor(row: &SqliteRow) -> Result<TaskCursor> {
    let status: String = row.try_get("status")?;
    Ok(TaskCursor {
        cursor: from_millis(row.try_get("cursor")?),
        status: TaskStatus::parse(&status),
        last_error: row.try_get("last_error")?,
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn key() -> TaskKey {
        TaskKey::new(Exchange::Bybit, "BTCUSDT", Interval::H1)
    }

    fn candle(hour: i64, close: i64) -> CandleRecord {
        CandleRecord {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            interval: Interval::H1,
            open_time: t0() + Interval::H1.duration() * hour as i32,
            open: Decimal::new(100, 0),
            high: Decimal::new(120, 0),
            low: Decimal::new(90, 0),
            close: Decimal::new(close, 0),
            volume: Decimal::new(15, 1),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn row_count(store: &SqliteStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM candles")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let batch: Vec<_> = (0..3).map(|h| candle(h, 110)).collect();

        assert_eq!(store.upsert_batch(&batch).await.unwrap(), 3);
        assert_eq!(store.upsert_batch(&batch).await.unwrap(), 0);
        assert_eq!(row_count(&store).await, 3);
    }

    #[tokio::test]
    async fn stored_candles_are_never_rewritten() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_batch(&[candle(0, 110)]).await.unwrap();
        assert_eq!(store.upsert_batch(&[candle(0, 95), candle(1, 111)]).await.unwrap(), 1);

        let close: String = sqlx::query_scalar("SELECT close FROM candles WHERE open_time = ?")
            .bind(t0().timestamp_millis())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(close, "110");
    }

    #[tokio::test]
    async fn failed_batch_leaves_store_unchanged() {
        let store = SqliteStore::in_memory().await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_third BEFORE INSERT ON candles
             WHEN NEW.close = '999' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let batch = vec![candle(0, 110), candle(1, 110), candle(2, 999)];
        let err = store.upsert_batch(&batch).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(row_count(&store).await, 0);
    }

    #[tokio::test]
    async fn stats_group_by_triple() {
        let store = SqliteStore::in_memory().await.unwrap();
        let batch: Vec<_> = (0..4).map(|h| candle(h, 110)).collect();
        store.upsert_batch(&batch).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].key, key());
        assert_eq!(stats[0].candles, 4);
        assert_eq!(stats[0].earliest, Some(t0()));
        assert_eq!(stats[0].latest, Some(t0() + Interval::H1.duration() * 3));
    }

    #[tokio::test]
    async fn cursor_only_advances() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_cursor(&key()).await.unwrap().is_none());

        let later = t0() + Interval::H1.duration() * 5;
        store.advance_cursor(&key(), later).await.unwrap();
        store.advance_cursor(&key(), t0()).await.unwrap();
        assert_eq!(store.load_cursor(&key()).await.unwrap().unwrap().cursor, Some(later));

        store.rewind_cursor(&key(), t0()).await.unwrap();
        assert_eq!(store.load_cursor(&key()).await.unwrap().unwrap().cursor, Some(t0()));
    }

    #[tokio::test]
    async fn failure_status_round_trips() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.advance_cursor(&key(), t0()).await.unwrap();
        store.mark_failed(&key(), "retry ceiling exceeded").await.unwrap();

        let cursor = store.load_cursor(&key()).await.unwrap().unwrap();
        assert_eq!(cursor.status, TaskStatus::Failed);
        assert_eq!(cursor.last_error.as_deref(), Some("retry ceiling exceeded"));
        assert_eq!(cursor.cursor, Some(t0()));

        store.clear_failed(&key()).await.unwrap();
        let listed = store.list_cursors().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, key());
        assert_eq!(listed[0].1.status, TaskStatus::Active);
        assert!(listed[0].1.last_error.is_none());
    }
}
