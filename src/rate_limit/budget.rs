use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use crate::types::Exchange;

/// Request budget for one exchange.
///
/// Accounting is a fixed window: `current_count` grows on each grant and is
/// zeroed once `window_start + window` has passed. A fixed window alone lets a
/// burst at the tail of one window run straight into a burst at the head of
/// the next, so the last grants are also kept and no grant is handed out while
/// `max_requests_per_window` grants already fall inside the trailing window.
#[derive(Clone, Debug)]
pub struct RateLimitBudget {
    pub exchange: Exchange,
    pub max_requests_per_window: u32,
    pub window: Duration,
    pub current_count: u32,
    pub window_start: Instant,
    grants: VecDeque<Instant>,
}

impl RateLimitBudget {
    pub fn new(exchange: Exchange, max_requests_per_window: u32, window: Duration, now: Instant) -> Self {
        RateLimitBudget {
            exchange,
            max_requests_per_window: max_requests_per_window.max(1),
            window,
            current_count: 0,
            window_start: now,
            grants: VecDeque::new(),
        }
    }

    /// Take a slot at `now`, or return the instant at which to try again.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Instant> {
        // Reset window if expired
        if now >= self.window_start + self.window {
            self.current_count = 0;
            self.window_start = now;
        }

        // Forget grants older than one window
        while let Some(&front) = self.grants.front() {
            if now.duration_since(front) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }

        if self.current_count >= self.max_requests_per_window {
            return Err(self.window_start + self.window);
        }

        let max = self.max_requests_per_window as usize;
        if self.grants.len() >= max {
            let blocking = self.grants[self.grants.len() - max];
            return Err(blocking + self.window);
        }

        self.current_count += 1;
        self.grants.push_back(now);
        Ok(())
    }

    /// Lower the per-window maximum. Raising it requires reconfiguration.
    pub fn lower_limit(&mut self, max_requests_per_window: u32) -> bool {
        let max_requests_per_window = max_requests_per_window.max(1);
        if max_requests_per_window < self.max_requests_per_window {
            self.max_requests_per_window = max_requests_per_window;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_requests_per_window.saturating_sub(self.current_count)
    }
}
