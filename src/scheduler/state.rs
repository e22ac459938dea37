use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use crate::exchange::RawCandle;
use crate::scheduler::backoff::Backoff;
use crate::types::{CandleRecord, TaskKey};

/// Where an ingestion task is in its fetch cycle.
///
/// Data in flight travels inside the state that consumes it, so a task
/// cancelled between two states never holds a half-applied batch.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskState {
    Idle,
    CheckingConnectivity,
    Fetching,
    Normalizing(Vec<RawCandle>),
    Storing(Vec<CandleRecord>),
    BackoffWait { delay: Duration },
    /// Terminal until an operator reset.
    Failed { reason: String },
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Idle => "IDLE",
            TaskState::CheckingConnectivity => "CHECKING_CONNECTIVITY",
            TaskState::Fetching => "FETCHING",
            TaskState::Normalizing(_) => "NORMALIZING",
            TaskState::Storing(_) => "STORING",
            TaskState::BackoffWait { .. } => "BACKOFF_WAIT",
            TaskState::Failed { .. } => "FAILED",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failed { .. })
    }

    /// States the task rests in between cycles.
    pub fn is_resting(&self) -> bool {
        matches!(
            self,
            TaskState::Idle | TaskState::BackoffWait { .. } | TaskState::Failed { .. }
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::BackoffWait { delay } => write!(f, "{} ({:?})", self.name(), delay),
            TaskState::Failed { reason } => write!(f, "{}: {}", self.name(), reason),
            _ => f.write_str(self.name()),
        }
    }
}

/// One (exchange, symbol, interval) ingestion task.
#[derive(Clone, Debug)]
pub struct IngestionTask {
    pub key: TaskKey,
    /// Open time of the next candle to fetch. `None` until resolved from the
    /// store or the configured start.
    pub cursor: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub backoff: Backoff,
    /// Consecutive retryable failures since the last stored batch.
    pub consecutive_failures: u32,
    /// Consecutive failed reachability checks.
    pub unreachable_checks: u32,
    /// Range requested by the cycle in progress.
    pub(crate) pending_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl IngestionTask {
    pub fn new(key: TaskKey, backoff: Backoff) -> Self {
        IngestionTask {
            key,
            cursor: None,
            state: TaskState::Idle,
            backoff,
            consecutive_failures: 0,
            unreachable_checks: 0,
            pending_range: None,
        }
    }
}
