use serde::{Deserialize, Serialize};
use std::fmt;
use crate::types::exchange::Exchange;
use crate::types::interval::Interval;

/// Identity of one ingestion task: a single (exchange, symbol, interval) triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub exchange: Exchange,
    pub symbol: String,
    pub interval: Interval,
}

impl TaskKey {
    pub fn new(exchange: Exchange, symbol: impl Into<String>, interval: Interval) -> Self {
        TaskKey {
            exchange,
            symbol: symbol.into().trim().to_uppercase(),
            interval,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.interval)
    }
}
