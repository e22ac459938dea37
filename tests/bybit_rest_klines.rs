use candle_ingest::config::{ExchangeConfig, RateLimitConfig};
use candle_ingest::error::{Error, ErrorKind};
use candle_ingest::exchange::{BybitClient, ExchangeClient};
use candle_ingest::rate_limit::RateLimiter;
use candle_ingest::types::{Exchange, Interval};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path, query_param},
};

const T0_MS: i64 = 1_704_067_200_000;
const HOUR_MS: i64 = 3_600_000;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn hours(n: i32) -> chrono::TimeDelta {
    Interval::H1.duration() * n
}

async fn setup(page_size: u32) -> (MockServer, BybitClient, Arc<RateLimiter>) {
    let server = MockServer::start().await;
    let limiter = Arc::new(RateLimiter::new().with_budget(
        Exchange::Bybit,
        &RateLimitConfig { max_requests: 10, window_secs: 1 },
    ));
    let config = ExchangeConfig {
        base_url: Some(server.uri()),
        page_size,
        ..ExchangeConfig::default()
    };
    let client = BybitClient::new(&config, Arc::clone(&limiter)).unwrap();
    (server, client, limiter)
}

/// Bybit kline rows `[startTime, open, high, low, close, volume, turnover]`,
/// newest first as the API returns them.
fn kline_rows(start_ms: i64, count: i64) -> Vec<Vec<String>> {
    (0..count)
        .rev()
        .map(|i| {
            let close = 42000 + i * 10;
            vec![
                (start_ms + i * HOUR_MS).to_string(),
                "42000".to_string(),
                (close + 50).to_string(),
                "41900".to_string(),
                close.to_string(),
                "12.5".to_string(),
                "525000".to_string(),
            ]
        })
        .collect()
}

fn envelope(rows: Vec<Vec<String>>) -> serde_json::Value {
    json!({
        "retCode": 0,
        "retMsg": "OK",
        "result": { "symbol": "BTCUSDT", "category": "spot", "list": rows },
        "time": T0_MS
    })
}

#[tokio::test]
async fn fetches_range_oldest_first() {
    let (server, client, _) = setup(1000).await;

    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .and(query_param("category", "spot"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("interval", "60"))
        .and(query_param("start", T0_MS.to_string()))
        .and(query_param("end", (T0_MS + 3 * HOUR_MS - 1).to_string()))
        .and(query_param("limit", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(kline_rows(T0_MS, 3))))
        .expect(1)
        .mount(&server)
        .await;

    let candles = client
        .fetch_candles("BTCUSDT", Interval::H1, t0(), t0() + hours(3))
        .await
        .unwrap();

    let open_times: Vec<String> = candles
        .iter()
        .map(|c| c.fields[0].as_str().unwrap().to_string())
        .collect();
    assert_eq!(open_times, vec![
        T0_MS.to_string(),
        (T0_MS + HOUR_MS).to_string(),
        (T0_MS + 2 * HOUR_MS).to_string(),
    ]);
    assert!(candles.iter().all(|c| c.exchange == Exchange::Bybit && c.interval == Interval::H1));
}

#[tokio::test]
async fn paginates_wide_ranges() {
    let (server, client, _) = setup(2).await;

    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .and(query_param("start", T0_MS.to_string()))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(kline_rows(T0_MS, 2))))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .and(query_param("start", (T0_MS + 2 * HOUR_MS).to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(kline_rows(T0_MS + 2 * HOUR_MS, 1))))
        .expect(1)
        .mount(&server)
        .await;

    let candles = client
        .fetch_candles("BTCUSDT", Interval::H1, t0(), t0() + hours(3))
        .await
        .unwrap();
    assert_eq!(candles.len(), 3);
    assert_eq!(candles[2].fields[0], json!((T0_MS + 2 * HOUR_MS).to_string()));
}

#[tokio::test]
async fn empty_range_makes_no_request() {
    let (server, client, _) = setup(1000).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let candles = client.fetch_candles("BTCUSDT", Interval::H1, t0(), t0()).await.unwrap();
    assert!(candles.is_empty());
}

#[tokio::test]
async fn unsupported_interval_is_a_configuration_error() {
    let (server, client, _) = setup(1000).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = client
        .fetch_candles("BTCUSDT", Interval::H8, t0(), t0() + hours(24))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    assert!(!client.supports(Interval::H8));
}

#[tokio::test]
async fn ret_codes_are_classified() {
    let cases = [
        (10001, ErrorKind::InvalidConfiguration, false),
        (10006, ErrorKind::ExchangeThrottled, true),
        (10016, ErrorKind::TransientNetwork, true),
    ];

    for (ret_code, kind, retryable) in cases {
        let (server, client, _) = setup(1000).await;
        Mock::given(method("GET"))
            .and(path("/v5/market/kline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "retCode": ret_code,
                "retMsg": "error",
                "result": {},
            })))
            .mount(&server)
            .await;

        let err = client
            .fetch_candles("BTCUSDT", Interval::H1, t0(), t0() + hours(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kind, "retCode {}", ret_code);
        assert_eq!(err.is_retryable(), retryable, "retCode {}", ret_code);
    }
}

#[tokio::test]
async fn ip_throttling_carries_reset_time() {
    let (server, client, _) = setup(1000).await;
    let reset = Utc::now().timestamp_millis() + 30_000;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("X-Bapi-Limit-Reset-Timestamp", reset.to_string().as_str()),
        )
        .mount(&server)
        .await;

    let err = client
        .fetch_candles("BTCUSDT", Interval::H1, t0(), t0() + hours(1))
        .await
        .unwrap_err();
    match err {
        Error::RateLimitExceeded { retry_after: Some(wait) } => {
            assert!(wait.as_secs() >= 20 && wait.as_secs() <= 30);
        }
        other => panic!("expected RateLimitExceeded, got {:?}", other),
    }
}

#[tokio::test]
async fn server_errors_and_garbage_are_retryable() {
    let (server, client, _) = setup(1000).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"retCode\":0,\"result\":{\"list\":[[\"17"))
        .mount(&server)
        .await;

    let unavailable = client
        .fetch_candles("BTCUSDT", Interval::H1, t0(), t0() + hours(1))
        .await
        .unwrap_err();
    assert_eq!(unavailable.kind(), ErrorKind::TransientNetwork);

    let malformed = client
        .fetch_candles("BTCUSDT", Interval::H1, t0(), t0() + hours(1))
        .await
        .unwrap_err();
    assert_eq!(malformed.kind(), ErrorKind::MalformedResponse);
    assert!(malformed.is_retryable());
}

#[tokio::test]
async fn advertised_limit_lowers_budget() {
    let (server, client, limiter) = setup(1000).await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(envelope(kline_rows(T0_MS, 1)))
                .insert_header("X-Bapi-Limit", "4"),
        )
        .mount(&server)
        .await;

    client
        .fetch_candles("BTCUSDT", Interval::H1, t0(), t0() + hours(1))
        .await
        .unwrap();
    let budget = limiter.budget(Exchange::Bybit).await.unwrap();
    assert_eq!(budget.max_requests_per_window, 4);
}
