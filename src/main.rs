use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use candle_ingest::config::AppConfig;
use candle_ingest::connectivity::{ConnectivityMonitor, HttpProbe};
use candle_ingest::exchange::build_clients;
use candle_ingest::observability::metrics::register_metrics;
use candle_ingest::observability::tracing::init_tracing;
use candle_ingest::rate_limit::RateLimiter;
use candle_ingest::scheduler::IngestionScheduler;
use candle_ingest::storage::{CandleStore, CursorStore, SqliteStore};
use candle_ingest::types::{Exchange, Interval, TaskKey};
use candle_ingest::utils::helper::format_time;
use candle_ingest::{DEFAULT_CONFIG_PATH, SHUTDOWN_GRACE_SECS};

const HEALTH_CHECK_SECS: u64 = 30;

#[derive(Parser)]
#[command(
    name = "candle-ingest",
    version,
    about = "Collects exchange OHLCV candles into a local store",
    propagate_version = true,
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest continuously until interrupted
    Run,
    /// Catch every task up to the newest closed candle, then exit
    Once,
    /// Show stored candle counts and task status
    Stats,
    /// Probe every configured exchange
    Check,
    /// Clear the FAILED status of a task
    Reset(TaskArgs),
    /// Rewind a task's cursor so the next run re-ingests from a point in time
    Backfill {
        #[command(flatten)]
        task: TaskArgs,

        /// RFC 3339 time to re-ingest from, e.g. 2024-01-01T00:00:00Z
        #[arg(long)]
        from: DateTime<Utc>,
    },
}

#[derive(Args)]
struct TaskArgs {
    #[arg(long)]
    exchange: Exchange,

    #[arg(long)]
    symbol: String,

    #[arg(long)]
    interval: Interval,
}

impl TaskArgs {
    fn key(&self) -> TaskKey {
        TaskKey::new(self.exchange, &self.symbol, self.interval)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config))?;

    init_tracing(&config.logging);
    register_metrics().context("registering metrics")?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Once => once(config).await,
        Commands::Stats => stats(config).await,
        Commands::Check => check(config).await,
        Commands::Reset(task) => {
            let store = SqliteStore::connect(&config.database).await?;
            store.clear_failed(&task.key()).await?;
            println!("{} reset", task.key());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backfill { task, from } => {
            let key = task.key();
            let from = key.interval.floor(from);
            let store = SqliteStore::connect(&config.database).await?;
            store.rewind_cursor(&key, from).await?;
            println!("{} will re-ingest from {}", key, format_time(Some(from)));
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build_scheduler(config: &AppConfig) -> anyhow::Result<IngestionScheduler> {
    let store = Arc::new(SqliteStore::connect(&config.database).await?);
    let limiter = Arc::new(RateLimiter::from_config(config));
    let clients = build_clients(config, limiter)?;
    let probe = HttpProbe::from_config(config)?;
    let connectivity = Arc::new(ConnectivityMonitor::from_config(
        Arc::new(probe),
        &config.connectivity,
    ));

    Ok(IngestionScheduler::new(
        config.scheduler.clone(),
        clients,
        connectivity,
        store.clone(),
        store,
    ))
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
    let mut scheduler = build_scheduler(&config).await?;
    scheduler.spawn_all(&config.tasks).await?;
    tracing::info!("Running {} ingestion tasks", scheduler.active_task_count());

    let mut health = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_SECS));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, shutting down");
                break;
            }
            _ = health.tick() => {
                if let Err(e) = scheduler.check_health() {
                    tracing::error!("{}", e);
                }
            }
        }
    }

    scheduler.shutdown(Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
    Ok(ExitCode::SUCCESS)
}

async fn once(config: AppConfig) -> anyhow::Result<ExitCode> {
    let scheduler = build_scheduler(&config).await?;
    let outcomes = scheduler.run_once(&config.tasks).await?;

    let mut failed = 0;
    for (key, state) in &outcomes {
        println!("{:<32} {}", key.to_string(), state);
        if state.is_failed() {
            failed += 1;
        }
    }

    if failed > 0 {
        eprintln!("{} of {} tasks FAILED", failed, outcomes.len());
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn stats(config: AppConfig) -> anyhow::Result<ExitCode> {
    let store = SqliteStore::connect(&config.database).await?;
    let stats = store.stats().await?;
    let cursors = store.list_cursors().await?;

    println!(
        "{:<32} {:>10} {:<24} {:<24} {:<24} {:<8}",
        "task", "candles", "earliest", "latest", "next open time", "status"
    );
    for key in config.task_keys() {
        let stat = stats.iter().find(|s| s.key == key);
        let cursor = cursors.iter().find(|(k, _)| *k == key).map(|(_, c)| c);

        println!(
            "{:<32} {:>10} {:<24} {:<24} {:<24} {:<8}",
            key.to_string(),
            stat.map(|s| s.candles).unwrap_or(0),
            format_time(stat.and_then(|s| s.earliest)),
            format_time(stat.and_then(|s| s.latest)),
            format_time(cursor.and_then(|c| c.cursor)),
            cursor.map(|c| c.status.as_str()).unwrap_or("new"),
        );
        if let Some(error) = cursor.and_then(|c| c.last_error.as_deref()) {
            println!("    last error: {}", error);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn check(config: AppConfig) -> anyhow::Result<ExitCode> {
    let probe = Arc::new(HttpProbe::from_config(&config)?);
    let network = probe.network_report().await;
    println!(
        "{:<8} dns {}, internet {}",
        "network",
        if network.dns_resolution { "ok" } else { "FAILED" },
        if network.internet { "ok" } else { "FAILED" },
    );

    let monitor = ConnectivityMonitor::from_config(probe, &config.connectivity);
    let mut all_reachable = true;
    for exchange in config.active_exchanges() {
        let reachable = monitor.check_reachable(exchange).await;
        all_reachable &= reachable;
        println!(
            "{:<8} {:<40} {}",
            exchange.as_str(),
            config.exchange(exchange).base_url(exchange),
            match (reachable, network.internet) {
                (true, _) => "reachable",
                (false, true) => "UNREACHABLE (exchange down)",
                (false, false) => "UNREACHABLE (no internet access)",
            }
        );
    }

    Ok(if all_reachable { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
