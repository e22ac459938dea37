use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Ingestion metrics
    pub static ref CANDLES_INSERTED: IntCounterVec = IntCounterVec::new(
        Opts::new("candles_inserted_total", "Candles newly written to the store"),
        &["exchange"]
    ).expect("valid metric definition");

    pub static ref TASKS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("tasks_failed_total", "Ingestion tasks that reached FAILED"),
        &["exchange"]
    ).expect("valid metric definition");

    // Exchange metrics
    pub static ref FETCH_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("fetch_requests_total", "Candle page requests sent to exchanges"),
        &["exchange"]
    ).expect("valid metric definition");

    pub static ref FETCH_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("fetch_errors_total", "Failed ingestion steps by error kind"),
        &["exchange", "kind"]
    ).expect("valid metric definition");

    pub static ref RATE_LIMIT_WAITS: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limit_waits_total", "Times a request waited for the rate limit window"),
        &["exchange"]
    ).expect("valid metric definition");

    pub static ref CONNECTIVITY_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("connectivity_failures_total", "Failed reachability probes"),
        &["exchange"]
    ).expect("valid metric definition");

    // Latency metrics
    pub static ref BACKOFF_DELAY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "backoff_delay_seconds",
            "Delay spent in BACKOFF_WAIT"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0])
    ).expect("valid metric definition");
}

/// Register all collectors with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CANDLES_INSERTED.clone()),
        Box::new(TASKS_FAILED.clone()),
        Box::new(FETCH_REQUESTS.clone()),
        Box::new(FETCH_ERRORS.clone()),
        Box::new(RATE_LIMIT_WAITS.clone()),
        Box::new(CONNECTIVITY_FAILURES.clone()),
        Box::new(BACKOFF_DELAY.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
