use rand::Rng;
use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_secs(2);
const DEFAULT_MAX: Duration = Duration::from_secs(300);

/// Retry delays for a scheduler loop after a failed reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX, true)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// Like `delay`, but never shorter than a server-provided `Retry-After`.
    /// The hint itself is not capped.
    pub fn delay_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay(attempt);
        match retry_after {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        let delay_ms = if self.jitter {
            // Upper half of the window.
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delays_double_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[test]
    fn jittered_delay_stays_in_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn retry_after_hint_extends_delay() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(20), false);
        assert_eq!(
            backoff.delay_after(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(backoff.delay_after(0, None), Duration::from_millis(10));
        assert_eq!(
            backoff.delay_after(1, Some(Duration::from_millis(1))),
            Duration::from_millis(20)
        );
    }
}
