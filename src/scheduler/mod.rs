pub mod backoff;
pub mod runner;
pub mod state;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use crate::config::{SchedulerConfig, TaskConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::exchange::ExchangeClient;
use crate::storage::{CandleStore, CursorStore};
use crate::types::{Exchange, TaskKey};
use crate::utils::task_supervisor::TaskSupervisor;

pub use backoff::Backoff;
pub use runner::{Clock, TaskCommand, TaskRunner};
pub use state::{IngestionTask, TaskState};

const COMMAND_BUFFER: usize = 16;

/// Owns every ingestion task and the state they share.
///
/// One [`TaskRunner`] per (exchange, symbol, interval). Tasks run
/// concurrently; the rate limiter inside each exchange client and the
/// [`ConnectivityMonitor`] serialize access to per-exchange state.
pub struct IngestionScheduler {
    config: SchedulerConfig,
    clients: HashMap<Exchange, Arc<dyn ExchangeClient>>,
    connectivity: Arc<ConnectivityMonitor>,
    candles: Arc<dyn CandleStore>,
    cursors: Arc<dyn CursorStore>,
    supervisor: TaskSupervisor,
    controls: HashMap<TaskKey, mpsc::Sender<TaskCommand>>,
    shutdown: watch::Sender<bool>,
}

impl IngestionScheduler {
    pub fn new(
        config: SchedulerConfig,
        clients: HashMap<Exchange, Arc<dyn ExchangeClient>>,
        connectivity: Arc<ConnectivityMonitor>,
        candles: Arc<dyn CandleStore>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        IngestionScheduler {
            config,
            clients,
            connectivity,
            candles,
            cursors,
            supervisor: TaskSupervisor::new(),
            controls: HashMap::new(),
            shutdown,
        }
    }

    /// Build and initialize the runner for one configured task.
    pub async fn runner(&self, task: &TaskConfig) -> Result<TaskRunner> {
        let key = task.key();
        let client = self.clients.get(&key.exchange).ok_or_else(|| {
            Error::InvalidConfiguration(format!("no client configured for {}", key.exchange))
        })?;
        if !client.supports(key.interval) {
            return Err(Error::InvalidConfiguration(format!(
                "{} does not offer {} candles",
                key.exchange, key.interval
            )));
        }

        let mut runner = TaskRunner::new(
            key,
            Arc::clone(client),
            Arc::clone(&self.connectivity),
            Arc::clone(&self.candles),
            Arc::clone(&self.cursors),
            self.config.clone(),
        )
        .with_start(task.backfill_from);
        runner.initialize().await?;
        Ok(runner)
    }

    /// Start a long-running task. A triple that is already running is rejected.
    pub async fn spawn(&mut self, task: &TaskConfig) -> Result<()> {
        let key = task.key();
        if self.supervisor.is_running(&key) {
            return Err(Error::InvalidConfiguration(format!("task {} is already running", key)));
        }

        let runner = self.runner(task).await?;
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        self.supervisor.spawn(key.clone(), runner.run(receiver, self.shutdown.subscribe()))?;
        self.controls.insert(key, commands);
        Ok(())
    }

    pub async fn spawn_all(&mut self, tasks: &[TaskConfig]) -> Result<()> {
        for task in tasks {
            self.spawn(task).await?;
        }
        Ok(())
    }

    /// Bring every task up to the newest closed candle once, concurrently,
    /// and report where each ended.
    pub async fn run_once(&self, tasks: &[TaskConfig]) -> Result<Vec<(TaskKey, TaskState)>> {
        let mut runners = Vec::with_capacity(tasks.len());
        for task in tasks {
            runners.push(self.runner(task).await?);
        }

        let outcomes = join_all(runners.into_iter().map(|mut runner| async move {
            let state = runner.run_until_caught_up().await.clone();
            (runner.task().key.clone(), state)
        }))
        .await;
        Ok(outcomes)
    }

    /// Rewind a running task to the candle containing `from`.
    pub async fn backfill(&self, key: &TaskKey, from: DateTime<Utc>) -> Result<()> {
        self.send(key, TaskCommand::Backfill(from)).await
    }

    /// Clear a FAILED task so it resumes.
    pub async fn reset(&self, key: &TaskKey) -> Result<()> {
        self.send(key, TaskCommand::Reset).await
    }

    async fn send(&self, key: &TaskKey, command: TaskCommand) -> Result<()> {
        let sender = self.controls.get(key).ok_or_else(|| {
            Error::InvalidConfiguration(format!("no running task {}", key))
        })?;
        sender.send(command).await.map_err(|_| {
            Error::InvalidConfiguration(format!("task {} has stopped", key))
        })
    }

    /// Report tasks that ended without being asked to.
    pub fn check_health(&mut self) -> Result<()> {
        let result = self.supervisor.check_health();
        let supervisor = &self.supervisor;
        self.controls.retain(|key, _| supervisor.is_running(key));
        result
    }

    pub fn active_task_count(&self) -> usize {
        self.supervisor.active_task_count()
    }

    /// Ask every task to stop between states, then abort what is still
    /// running after `grace`.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.shutdown.send_replace(true);
        self.supervisor.shutdown_all(grace).await;
        self.controls.clear();
    }
}
