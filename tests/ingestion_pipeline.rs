use candle_ingest::config::{ExchangeConfig, RateLimitConfig, SchedulerConfig};
use candle_ingest::connectivity::{ConnectivityMonitor, HttpProbe};
use candle_ingest::exchange::BybitClient;
use candle_ingest::rate_limit::RateLimiter;
use candle_ingest::scheduler::{TaskCommand, TaskRunner, TaskState};
use candle_ingest::storage::{CandleStore, CursorStore, SqliteStore};
use candle_ingest::types::{Exchange, Interval, TaskKey};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

const T0_MS: i64 = 1_704_067_200_000;
const HOUR_MS: i64 = 3_600_000;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn key() -> TaskKey {
    TaskKey::new(Exchange::Bybit, "BTCUSDT", Interval::H1)
}

/// Four hourly klines from T0, newest first. The newest one is still
/// forming when the clock reads T0+3h30m.
fn klines() -> serde_json::Value {
    let rows: Vec<Vec<String>> = (0..4)
        .rev()
        .map(|i: i64| {
            vec![
                (T0_MS + i * HOUR_MS).to_string(),
                "42000".to_string(),
                "42100".to_string(),
                "41900".to_string(),
                (42000 + i).to_string(),
                "3.25".to_string(),
                "136500".to_string(),
            ]
        })
        .collect();
    json!({ "retCode": 0, "retMsg": "OK", "result": { "list": rows } })
}

struct Pipeline {
    server: MockServer,
    store: SqliteStore,
}

impl Pipeline {
    async fn start() -> Self {
        Pipeline {
            server: MockServer::start().await,
            store: SqliteStore::in_memory().await.unwrap(),
        }
    }

    fn runner(&self, probe_target: String) -> TaskRunner {
        let limiter = Arc::new(RateLimiter::new().with_budget(
            Exchange::Bybit,
            &RateLimitConfig { max_requests: 50, window_secs: 1 },
        ));
        let exchange = ExchangeConfig {
            base_url: Some(self.server.uri()),
            ..ExchangeConfig::default()
        };
        let client = BybitClient::new(&exchange, limiter).unwrap();

        let probe = HttpProbe::new(Duration::from_secs(2))
            .unwrap()
            .with_target(Exchange::Bybit, probe_target);
        let connectivity = Arc::new(ConnectivityMonitor::new(Arc::new(probe), Duration::from_secs(2)));

        let store = Arc::new(self.store.clone());
        let config = SchedulerConfig {
            backoff_base_ms: 2,
            backoff_cap_ms: 20,
            ..SchedulerConfig::default()
        };
        let now = t0() + TimeDelta::minutes(210);

        TaskRunner::new(key(), Arc::new(client), connectivity, store.clone(), store, config)
            .with_start(Some(t0()))
            .with_clock(Arc::new(move || now))
    }

    async fn stored_candles(&self) -> u64 {
        self.store
            .stats()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.key == key())
            .map(|s| s.candles)
            .unwrap_or(0)
    }
}

#[tokio::test]
async fn ingests_closed_candles_once() {
    let pipeline = Pipeline::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(klines()))
        .expect(2)
        .mount(&pipeline.server)
        .await;

    let mut runner = pipeline.runner(pipeline.server.uri());
    runner.initialize().await.unwrap();
    assert_eq!(*runner.run_until_caught_up().await, TaskState::Idle);

    assert_eq!(pipeline.stored_candles().await, 3);
    let cursor = pipeline.store.load_cursor(&key()).await.unwrap().unwrap();
    assert_eq!(cursor.cursor, Some(t0() + TimeDelta::hours(3)));

    assert!(runner.handle_command(TaskCommand::Backfill(t0())).await);
    assert_eq!(*runner.run_until_caught_up().await, TaskState::Idle);
    assert_eq!(pipeline.stored_candles().await, 3);

    let stats = pipeline.store.stats().await.unwrap();
    assert_eq!(stats[0].earliest, Some(t0()));
    assert_eq!(stats[0].latest, Some(t0() + TimeDelta::hours(2)));
}

#[tokio::test]
async fn recovers_from_throttling() {
    let pipeline = Pipeline::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&pipeline.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(klines()))
        .expect(1)
        .mount(&pipeline.server)
        .await;

    let mut runner = pipeline.runner(pipeline.server.uri());
    runner.initialize().await.unwrap();
    assert_eq!(*runner.run_until_caught_up().await, TaskState::Idle);

    assert_eq!(runner.task().consecutive_failures, 0);
    assert_eq!(runner.task().backoff.attempt(), 0);
    assert_eq!(pipeline.stored_candles().await, 3);
}

#[tokio::test]
async fn rejected_symbol_fails_the_task() {
    let pipeline = Pipeline::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 10001,
            "retMsg": "Not supported symbols",
            "result": {}
        })))
        .expect(1)
        .mount(&pipeline.server)
        .await;

    let mut runner = pipeline.runner(pipeline.server.uri());
    runner.initialize().await.unwrap();
    assert!(runner.run_until_caught_up().await.is_failed());

    let cursor = pipeline.store.load_cursor(&key()).await.unwrap().unwrap();
    assert_eq!(cursor.cursor, None);
    assert!(cursor.last_error.unwrap().contains("Not supported symbols"));
    assert_eq!(pipeline.stored_candles().await, 0);
}

#[tokio::test]
async fn unreachable_exchange_is_not_fetched() {
    let pipeline = Pipeline::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(klines()))
        .expect(0)
        .mount(&pipeline.server)
        .await;

    // nothing listens on port 1
    let mut runner = pipeline.runner("http://127.0.0.1:1".to_string());
    runner.initialize().await.unwrap();
    runner.step().await;
    runner.step().await;

    assert!(matches!(runner.state(), TaskState::BackoffWait { .. }));
    assert_eq!(runner.task().consecutive_failures, 0);
    assert_eq!(pipeline.stored_candles().await, 0);
}
