use tracing::{Span, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use crate::config::LoggingConfig;
use crate::types::{Exchange, Interval, TaskKey};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    if let Err(e) = build_subscriber(config, filter, std::io::stdout).try_init() {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
}

/// Formatting subscriber writing to `writer`. Event targets are kept so
/// alerts stay routable by target; output carries no colour codes.
pub fn build_subscriber<W>(
    config: &LoggingConfig,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    if config.json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    }
}

pub fn trace_ingestion_task(key: &TaskKey) -> Span {
    tracing::info_span!(
        "ingestion_task",
        exchange = %key.exchange,
        symbol = %key.symbol,
        interval = %key.interval,
    )
}

pub fn trace_fetch(exchange: Exchange, symbol: &str, interval: Interval) -> Span {
    tracing::debug_span!(
        "fetch_candles",
        exchange = %exchange,
        symbol = %symbol,
        interval = %interval,
    )
}
