use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

// 2^16 times the base delay is past any sensible cap already.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Consecutive failed connection attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failed
    /// attempts, without jitter. Zero failures (a dropped but previously
    /// healthy connection) waits the base delay.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        self.jittered(self.backoff(failures), &mut rand::thread_rng())
    }

    pub fn jittered<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter_ratio.is_nan() {
            return delay;
        }
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * ratio;
        delay + Duration::from_secs_f64(rng.gen_range(0.0..=spread))
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) if max > 0 => failures >= max,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_secs(2);
        for _ in 0..200 {
            let delay = policy.jittered(base, &mut rng);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(401));
        }
    }

    #[test]
    fn zero_ratio_disables_jitter() {
        let policy = RetryPolicy {
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
    }

    #[test]
    fn unusable_ratio_disables_jitter() {
        let mut rng = StdRng::seed_from_u64(3);
        let base = Duration::from_secs(1);
        for ratio in [f64::NAN, -0.5] {
            let policy = RetryPolicy {
                jitter_ratio: ratio,
                ..RetryPolicy::default()
            };
            assert_eq!(policy.jittered(base, &mut rng), base);
        }
        let wide = RetryPolicy {
            jitter_ratio: f64::INFINITY,
            ..RetryPolicy::default()
        };
        assert!(wide.jittered(base, &mut rng) <= base * 2);
    }

    #[test]
    fn max_attempts_bounds_retries() {
        let unlimited = RetryPolicy::default();
        assert!(!unlimited.exhausted(10_000));

        let bounded = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        };
        assert!(!bounded.exhausted(2));
        assert!(bounded.exhausted(3));

        let zero = RetryPolicy {
            max_attempts: Some(0),
            ..RetryPolicy::default()
        };
        assert!(!zero.exhausted(50));
    }
}
