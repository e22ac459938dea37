use tokio::task::JoinHandle;
use std::collections::HashMap;
use std::time::Duration;
use crate::error::{Error, Result};
use crate::types::TaskKey;
use tracing::{info, error};

/// Task Supervisor - owns the spawned ingestion tasks
///
/// At most one live task per [`TaskKey`]: spawning a key whose task is still
/// running is rejected, so live polling and backfill for one triple never run
/// side by side.
pub struct TaskSupervisor {
    tasks: HashMap<TaskKey, JoinHandle<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        TaskSupervisor {
            tasks: HashMap::new(),
        }
    }

    /// Spawn a task for `key` and register it for monitoring
    pub fn spawn<F>(&mut self, key: TaskKey, future: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(handle) = self.tasks.get(&key) {
            if !handle.is_finished() {
                return Err(Error::InvalidConfiguration(format!(
                    "task {} is already running",
                    key
                )));
            }
        }

        let handle = tokio::spawn(future);
        info!("Spawned ingestion task: {}", key);
        self.tasks.insert(key, handle);
        Ok(())
    }

    pub fn is_running(&self, key: &TaskKey) -> bool {
        self.tasks.get(key).is_some_and(|handle| !handle.is_finished())
    }

    /// Drop tasks that have terminated and report them
    pub fn check_health(&mut self) -> Result<()> {
        let finished: Vec<TaskKey> = self.tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        if finished.is_empty() {
            return Ok(());
        }

        for key in &finished {
            self.tasks.remove(key);
        }

        let names: Vec<String> = finished.iter().map(ToString::to_string).collect();
        let error_msg = format!("Tasks terminated unexpectedly: {}", names.join(", "));
        error!("{}", error_msg);
        Err(Error::InvalidConfiguration(error_msg))
    }

    /// Get count of active tasks
    pub fn active_task_count(&self) -> usize {
        self.tasks.values().filter(|handle| !handle.is_finished()).count()
    }

    /// Wait up to `grace` for every task to finish, then abort the rest
    pub async fn shutdown_all(&mut self, grace: Duration) {
        info!("Shutting down {} ingestion tasks", self.tasks.len());

        let deadline = tokio::time::Instant::now() + grace;
        for (key, mut handle) in self.tasks.drain() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!("Task {} stopped", key),
                Ok(Err(e)) => error!("Task {} ended abnormally: {}", key, e),
                Err(_) => {
                    handle.abort();
                    info!("Aborted task: {}", key);
                }
            }
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
