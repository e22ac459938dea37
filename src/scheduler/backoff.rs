use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter: `base * 2^attempt + jitter`, capped.
///
/// Jitter is drawn from `[0, base)`, which keeps each uncapped delay above the
/// previous one. Delays never shrink between resets, including after an
/// exchange-mandated `retry_after` longer than the schedule.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    last_delay: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Backoff {
            base,
            cap: cap.max(base),
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let exponential = self.base.saturating_mul(factor);

        let base_ms = self.base.as_millis() as u64;
        let jitter = if base_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
        } else {
            Duration::ZERO
        };

        let mut delay = exponential.saturating_add(jitter).min(self.cap);
        delay = delay.max(self.last_delay);
        if let Some(retry_after) = retry_after {
            delay = delay.max(retry_after);
        }

        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grows_then_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let first = backoff.next_delay(None);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));

        let second = backoff.next_delay(None);
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(300));

        for _ in 0..10 {
            assert!(backoff.next_delay(None) <= Duration::from_millis(1000));
        }
        assert_eq!(backoff.attempt(), 12);
    }

    #[test]
    fn honours_retry_after_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(Some(Duration::from_secs(30))), Duration::from_secs(30));
        // never shorter than the previous wait
        assert_eq!(backoff.next_delay(None), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay(None) < Duration::from_millis(200));
    }

    proptest! {
        #[test]
        fn delays_never_decrease(
            base_ms in 1u64..2_000,
            cap_factor in 1u64..100,
            retry_afters in proptest::collection::vec(proptest::option::of(0u64..120_000), 1..40),
        ) {
            let mut backoff = Backoff::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(base_ms * cap_factor),
            );

            let mut previous = Duration::ZERO;
            for retry_after in retry_afters {
                let delay = backoff.next_delay(retry_after.map(Duration::from_millis));
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
