use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use crate::config::ConnectivityConfig;
use crate::connectivity::probe::Probe;
use crate::observability::metrics::CONNECTIVITY_FAILURES;
use crate::types::Exchange;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub is_reachable: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Tracks whether each exchange's API is reachable.
///
/// State is per exchange and shared by every task targeting it. Updates go
/// through the map entry, so concurrent probes and failure reports for one
/// exchange are applied one at a time.
pub struct ConnectivityMonitor {
    probe: Arc<dyn Probe>,
    timeout: Duration,
    max_failures: u32,
    states: DashMap<Exchange, ConnectivityState>,
}

const DEFAULT_MAX_FAILURES: u32 = 5;

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn Probe>, timeout: Duration) -> Self {
        ConnectivityMonitor {
            probe,
            timeout,
            max_failures: DEFAULT_MAX_FAILURES,
            states: DashMap::new(),
        }
    }

    pub fn from_config(probe: Arc<dyn Probe>, config: &ConnectivityConfig) -> Self {
        ConnectivityMonitor::new(probe, config.timeout()).with_max_failures(config.max_failures)
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Failed checks in a row a task tolerates before giving up.
    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Probe `exchange`, bounded by the configured timeout. A timeout counts
    /// as a failure.
    pub async fn check_reachable(&self, exchange: Exchange) -> bool {
        let reachable = tokio::time::timeout(self.timeout, self.probe.probe(exchange))
            .await
            .unwrap_or(false);

        if reachable {
            self.record_success(exchange);
        } else {
            self.record_failure(exchange);
        }
        reachable
    }

    pub fn record_success(&self, exchange: Exchange) {
        let mut state = self.states.entry(exchange).or_default();
        state.is_reachable = true;
        state.consecutive_failures = 0;
        state.last_checked_at = Some(Utc::now());
    }

    /// Note a failed probe or a request that failed at the network level.
    pub fn record_failure(&self, exchange: Exchange) {
        let mut state = self.states.entry(exchange).or_default();
        state.is_reachable = false;
        state.consecutive_failures += 1;
        state.last_checked_at = Some(Utc::now());
        CONNECTIVITY_FAILURES.with_label_values(&[exchange.as_str()]).inc();

        tracing::warn!(
            "{} unreachable ({} consecutive failures)",
            exchange,
            state.consecutive_failures
        );
    }

    pub fn state(&self, exchange: Exchange) -> ConnectivityState {
        self.states
            .get(&exchange)
            .map(|state| state.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::probe::MockProbe;
    use async_trait::async_trait;

    fn monitor_with(probe: MockProbe) -> ConnectivityMonitor {
        ConnectivityMonitor::new(Arc::new(probe), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn failures_accumulate_and_success_resets() {
        let mut probe = MockProbe::new();
        let mut seq = mockall::Sequence::new();
        probe.expect_probe().times(2).in_sequence(&mut seq).returning(|_| false);
        probe.expect_probe().times(1).in_sequence(&mut seq).returning(|_| true);
        let monitor = monitor_with(probe);

        assert!(!monitor.check_reachable(Exchange::Bybit).await);
        assert!(!monitor.check_reachable(Exchange::Bybit).await);
        assert_eq!(monitor.state(Exchange::Bybit).consecutive_failures, 2);

        assert!(monitor.check_reachable(Exchange::Bybit).await);
        let state = monitor.state(Exchange::Bybit);
        assert!(state.is_reachable);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn state_is_per_exchange() {
        let mut probe = MockProbe::new();
        probe.expect_probe()
            .returning(|exchange| exchange == Exchange::Binance);
        let monitor = monitor_with(probe);

        assert!(!monitor.check_reachable(Exchange::Bybit).await);
        assert!(monitor.check_reachable(Exchange::Binance).await);
        assert_eq!(monitor.state(Exchange::Bybit).consecutive_failures, 1);
        assert_eq!(monitor.state(Exchange::Binance).consecutive_failures, 0);
    }

    struct HangingProbe;

    #[async_trait]
    impl Probe for HangingProbe {
        async fn probe(&self, _exchange: Exchange) -> bool {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_is_bounded_by_timeout() {
        let monitor = ConnectivityMonitor::new(Arc::new(HangingProbe), Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        assert!(!monitor.check_reachable(Exchange::Binance).await);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(monitor.state(Exchange::Binance).consecutive_failures, 1);
    }

    #[test]
    fn failure_limit_comes_from_config() {
        let config = ConnectivityConfig { max_failures: 2, ..ConnectivityConfig::default() };
        let monitor = ConnectivityMonitor::from_config(Arc::new(MockProbe::new()), &config);
        assert_eq!(monitor.max_failures(), 2);
        assert_eq!(monitor_with(MockProbe::new()).with_max_failures(0).max_failures(), 1);
    }

    #[test]
    fn unknown_exchange_reports_default_state() {
        let monitor = monitor_with(MockProbe::new());
        assert_eq!(monitor.state(Exchange::Bybit), ConnectivityState::default());
    }
}
