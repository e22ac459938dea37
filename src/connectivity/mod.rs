pub mod monitor;
pub mod probe;

pub use monitor::{ConnectivityMonitor, ConnectivityState};
pub use probe::{HttpProbe, NetworkReport, Probe};
