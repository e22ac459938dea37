pub mod config;
pub mod connectivity;
pub mod error;
pub mod exchange;
pub mod normalizer;
pub mod observability;
pub mod rate_limit;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod utils;

pub use error::{Error, ErrorKind, Result};

// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// Time allowed for tasks to finish their current state on shutdown
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
