use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};
use crate::config::SchedulerConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, ErrorKind, Result};
use crate::exchange::{ExchangeClient, RawCandle};
use crate::normalizer::RecordNormalizer;
use crate::observability::metrics::{BACKOFF_DELAY, CANDLES_INSERTED, FETCH_ERRORS, TASKS_FAILED};
use crate::observability::tracing::trace_ingestion_task;
use crate::scheduler::backoff::Backoff;
use crate::scheduler::state::{IngestionTask, TaskState};
use crate::storage::{CandleStore, CursorStore, TaskStatus};
use crate::types::{CandleRecord, TaskKey};
use crate::utils::helper::alert_operations_team_critical;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Operator commands delivered to a running task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskCommand {
    /// Rewind the cursor to the candle containing the given time.
    Backfill(DateTime<Utc>),
    /// Clear FAILED and resume from the stored cursor.
    Reset,
}

/// Drives one [`IngestionTask`] through its states.
///
/// Transitions are strictly sequential. `step` performs exactly one
/// transition; the waits attached to IDLE and BACKOFF_WAIT are taken by the
/// caller (`run` or `run_cycle`), which is where commands and shutdown are
/// observed.
pub struct TaskRunner {
    task: IngestionTask,
    client: Arc<dyn ExchangeClient>,
    connectivity: Arc<ConnectivityMonitor>,
    candles: Arc<dyn CandleStore>,
    cursors: Arc<dyn CursorStore>,
    config: SchedulerConfig,
    start_from: Option<DateTime<Utc>>,
    clock: Clock,
    behind: bool,
}

impl TaskRunner {
    pub fn new(
        key: TaskKey,
        client: Arc<dyn ExchangeClient>,
        connectivity: Arc<ConnectivityMonitor>,
        candles: Arc<dyn CandleStore>,
        cursors: Arc<dyn CursorStore>,
        config: SchedulerConfig,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base(), config.backoff_cap());
        TaskRunner {
            task: IngestionTask::new(key, backoff),
            client,
            connectivity,
            candles,
            cursors,
            config,
            start_from: None,
            clock: Arc::new(Utc::now),
            // nothing fetched yet, so the first cycle starts immediately
            behind: true,
        }
    }

    /// First candle to fetch when the store holds no cursor for this task.
    pub fn with_start(mut self, start_from: Option<DateTime<Utc>>) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn task(&self) -> &IngestionTask {
        &self.task
    }

    pub fn state(&self) -> &TaskState {
        &self.task.state
    }

    /// Whether the last cycle stopped short of the newest closed candle.
    pub fn is_behind(&self) -> bool {
        self.behind
    }

    /// Restore the stored cursor and status. A task persisted as FAILED
    /// stays FAILED until reset.
    pub async fn initialize(&mut self) -> Result<()> {
        if let Some(stored) = self.cursors.load_cursor(&self.task.key).await? {
            self.task.cursor = stored.cursor;
            if stored.status == TaskStatus::Failed {
                let reason = stored.last_error
                    .unwrap_or_else(|| "failed in a previous run".to_string());
                warn!("{} is still FAILED: {}", self.task.key, reason);
                self.task.state = TaskState::Failed { reason };
            }
        }
        Ok(())
    }

    /// Perform one state transition.
    pub async fn step(&mut self) {
        let state = std::mem::replace(&mut self.task.state, TaskState::Idle);
        let from = state.name();

        let next = match state {
            TaskState::Idle => TaskState::CheckingConnectivity,
            TaskState::CheckingConnectivity => self.check_connectivity().await,
            TaskState::Fetching => match self.fetch().await {
                Ok(raw) => TaskState::Normalizing(raw),
                Err(e) => self.on_error(e).await,
            },
            TaskState::Normalizing(raw) => match self.normalize(&raw) {
                Ok(records) => TaskState::Storing(records),
                Err(e) => self.on_error(e).await,
            },
            TaskState::Storing(records) => match self.store(&records).await {
                Ok(()) => TaskState::Idle,
                Err(e) => self.on_error(e).await,
            },
            TaskState::BackoffWait { .. } => TaskState::CheckingConnectivity,
            failed @ TaskState::Failed { .. } => failed,
        };

        debug!("{}: {} -> {}", self.task.key, from, next.name());
        self.task.state = next;
    }

    /// Run from IDLE until the task rests in IDLE or FAILED again, sleeping
    /// through any backoff on the way.
    pub async fn run_cycle(&mut self) {
        if self.task.state.is_failed() {
            return;
        }

        loop {
            if let TaskState::BackoffWait { delay } = self.task.state {
                tokio::time::sleep(delay).await;
            }
            self.step().await;
            if matches!(self.task.state, TaskState::Idle | TaskState::Failed { .. }) {
                break;
            }
        }
    }

    /// Run cycles back to back until the newest closed candle is stored or
    /// the task fails.
    pub async fn run_until_caught_up(&mut self) -> &TaskState {
        loop {
            self.run_cycle().await;
            if self.task.state.is_failed() || !self.behind {
                break;
            }
        }
        &self.task.state
    }

    /// Long-running loop. Polls every `poll_interval`, or immediately while
    /// behind. Stops when `shutdown` turns true or its sender goes away.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<TaskCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let span = trace_ingestion_task(&self.task.key);
        async move {
            info!("Starting ingestion task");
            loop {
                if *shutdown.borrow() {
                    break;
                }

                if self.task.state.is_resting() {
                    let wait = self.rest_duration();
                    if !self.rest(wait, &mut commands, &mut shutdown).await {
                        break;
                    }
                    if self.task.state.is_failed() {
                        continue;
                    }
                }

                self.step().await;
            }
            info!("Ingestion task stopped in {}", self.task.state.name());
        }
        .instrument(span)
        .await
    }

    /// Apply an operator command. Returns true when a cycle should start now.
    pub async fn handle_command(&mut self, command: TaskCommand) -> bool {
        let key = self.task.key.clone();
        match command {
            TaskCommand::Backfill(from) => {
                let from = key.interval.floor(from);
                if let Err(e) = self.cursors.rewind_cursor(&key, from).await {
                    error!("Could not rewind {} to {}: {}", key, from, e);
                    return false;
                }
                self.task.cursor = Some(from);
                self.behind = true;
                info!("Rewound {} to {}", key, from);
                matches!(self.task.state, TaskState::Idle)
            }
            TaskCommand::Reset => {
                if !self.task.state.is_failed() {
                    debug!("Ignoring reset for {} in {}", key, self.task.state.name());
                    return false;
                }
                if let Err(e) = self.cursors.clear_failed(&key).await {
                    error!("Could not reset {}: {}", key, e);
                    return false;
                }
                self.task.backoff.reset();
                self.task.consecutive_failures = 0;
                self.task.unreachable_checks = 0;
                self.task.state = TaskState::Idle;
                self.behind = true;
                info!("Reset {}", key);
                true
            }
        }
    }

    fn rest_duration(&self) -> Option<Duration> {
        match &self.task.state {
            TaskState::Idle if self.behind => Some(Duration::ZERO),
            TaskState::Idle => Some(self.config.poll_interval()),
            TaskState::BackoffWait { delay } => Some(*delay),
            _ => None,
        }
    }

    /// Wait out `wait` (forever when `None`) while serving commands. Returns
    /// false on shutdown.
    async fn rest(
        &mut self,
        wait: Option<Duration>,
        commands: &mut mpsc::Receiver<TaskCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let timer = async move {
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return true,
                Some(command) = commands.recv() => {
                    if self.handle_command(command).await {
                        return true;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    async fn check_connectivity(&mut self) -> TaskState {
        let exchange = self.task.key.exchange;
        if self.connectivity.check_reachable(exchange).await {
            self.task.unreachable_checks = 0;
            return TaskState::Fetching;
        }

        // Outages have their own ceiling, separate from request failures.
        self.task.unreachable_checks += 1;
        let max_failures = self.connectivity.max_failures();
        if self.task.unreachable_checks >= max_failures {
            let reason = format!(
                "{} unreachable after {} consecutive checks",
                exchange, self.task.unreachable_checks
            );
            return self.fail(reason).await;
        }

        let delay = self.task.backoff.next_delay(None);
        BACKOFF_DELAY.observe(delay.as_secs_f64());
        warn!(
            "{} unreachable (check {}/{}), checking again in {:?}",
            exchange, self.task.unreachable_checks, max_failures, delay
        );
        TaskState::BackoffWait { delay }
    }

    async fn fetch(&mut self) -> Result<Vec<RawCandle>> {
        let now = (self.clock)();
        let interval = self.task.key.interval;
        let from = self.resolve_cursor(now).await?;

        // the candle opening at floor(now) is still forming
        let closed_until = interval.floor(now);
        let to = closed_until.min(from + interval.duration() * self.config.batch_limit as i32);
        self.task.pending_range = Some((from, to));

        if from >= to {
            return Ok(Vec::new());
        }

        debug!("Fetching {} from {} to {}", self.task.key, from, to);
        self.client.fetch_candles(&self.task.key.symbol, interval, from, to).await
    }

    async fn resolve_cursor(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if let Some(cursor) = self.task.cursor {
            return Ok(cursor);
        }

        let stored = self.cursors
            .load_cursor(&self.task.key)
            .await?
            .and_then(|stored| stored.cursor);

        let cursor = match (stored, self.start_from) {
            (Some(cursor), _) => cursor,
            (None, Some(start)) => self.task.key.interval.floor(start),
            (None, None) => {
                let days = self.config.default_lookback_days;
                let start = TimeDelta::try_days(days as i64)
                    .and_then(|lookback| now.checked_sub_signed(lookback))
                    .ok_or_else(|| {
                        Error::InvalidConfiguration(format!("lookback of {} days is out of range", days))
                    })?;
                self.task.key.interval.floor(start)
            }
        };
        self.task.cursor = Some(cursor);
        Ok(cursor)
    }

    fn normalize(&self, raw: &[RawCandle]) -> Result<Vec<CandleRecord>> {
        let mut records = RecordNormalizer::normalize_batch(raw)?;

        if let Some((from, to)) = self.task.pending_range {
            let received = records.len();
            records.retain(|r| r.open_time >= from && r.open_time < to);
            if records.len() < received {
                debug!(
                    "Dropped {} candles outside {}..{}",
                    received - records.len(),
                    from,
                    to
                );
            }
        }
        Ok(records)
    }

    async fn store(&mut self, records: &[CandleRecord]) -> Result<()> {
        let key = self.task.key.clone();
        let interval = key.interval;

        let inserted = self.candles.upsert_batch(records).await?;
        CANDLES_INSERTED.with_label_values(&[key.exchange.as_str()]).inc_by(inserted);

        let now = (self.clock)();
        let closed_until = interval.floor(now);
        let next = match (records.last(), self.task.pending_range) {
            (Some(last), _) => Some(last.next_open_time()),
            // A gap behind the newest closed candle is settled.
            (None, Some((_, to))) if to < closed_until => Some(to),
            // The newest closed candle may not be published yet.
            (None, Some((from, to))) => Some((to - interval.duration()).max(from)),
            (None, None) => None,
        };

        if let Some(next) = next {
            if self.task.cursor.is_none_or(|cursor| next > cursor) {
                self.cursors.advance_cursor(&key, next).await?;
                self.task.cursor = Some(next);
            }
        }

        self.behind = match self.task.pending_range.take() {
            Some((_, to)) => to < closed_until,
            None => false,
        };
        self.task.backoff.reset();
        self.task.consecutive_failures = 0;

        info!(
            "Stored {} new of {} candles for {}, next open time {:?}",
            inserted,
            records.len(),
            key,
            self.task.cursor
        );
        Ok(())
    }

    async fn on_error(&mut self, error: Error) -> TaskState {
        let exchange = self.task.key.exchange;
        FETCH_ERRORS
            .with_label_values(&[exchange.as_str(), error.kind().as_str()])
            .inc();

        if error.kind() == ErrorKind::TransientNetwork {
            self.connectivity.record_failure(exchange);
        }

        if !error.is_retryable() {
            return self.fail(error.to_string()).await;
        }

        self.task.consecutive_failures += 1;
        if self.task.consecutive_failures > self.config.max_retries {
            let reason = format!(
                "gave up after {} consecutive failures: {}",
                self.task.consecutive_failures, error
            );
            return self.fail(reason).await;
        }

        let delay = self.task.backoff.next_delay(error.retry_after());
        BACKOFF_DELAY.observe(delay.as_secs_f64());
        warn!(
            "{} failed (attempt {}/{}): {}; retrying in {:?}",
            self.task.key,
            self.task.consecutive_failures,
            self.config.max_retries,
            error,
            delay
        );
        TaskState::BackoffWait { delay }
    }

    async fn fail(&mut self, reason: String) -> TaskState {
        let key = &self.task.key;
        TASKS_FAILED.with_label_values(&[key.exchange.as_str()]).inc();
        self.task.pending_range = None;

        if let Err(e) = self.cursors.mark_failed(key, &reason).await {
            error!("Could not persist FAILED status for {}: {}", key, e);
        }
        alert_operations_team_critical(format!("Ingestion task {} FAILED: {}", key, reason));

        TaskState::Failed { reason }
    }
}
