use std::time::Duration;

use rand::Rng;

/// Retry timing for everything in the crate that loops on a contended or
/// unreachable resource: the cloud join protocol, cloud-wide client
/// registration, and the client's failover-await poll.
///
/// Delays grow as `base * multiplier^attempt`, jittered uniformly down to
/// half the computed value, and never exceed `cap`.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            multiplier: 2,
            cap: Duration::from_millis(300),
            max_attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// The jittered delay to sleep before retry number `attempt`
    /// (0-based), or `None` once the attempt budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let scaled = self
            .base
            .saturating_mul(self.multiplier.saturating_pow(attempt))
            .min(self.cap);
        let micros = scaled.as_micros() as u64;
        if micros == 0 {
            return Some(Duration::ZERO);
        }
        let jittered =
            rand::thread_rng().gen_range(micros / 2..=micros.max(1));
        Some(Duration::from_micros(jittered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(10),
            multiplier: 2,
            cap: Duration::from_millis(40),
            max_attempts: 5,
        };
        for attempt in 0..5 {
            let d = policy.delay(attempt).unwrap();
            let full = Duration::from_millis(10 * 2u64.pow(attempt))
                .min(Duration::from_millis(40));
            assert!(d <= full, "attempt {attempt}: {d:?} > {full:?}");
            assert!(d >= full / 2, "attempt {attempt}: {d:?} < {:?}", full / 2);
        }
    }

    #[test]
    fn budget_is_bounded() {
        let policy = BackoffPolicy::default();
        assert!(policy.delay(policy.max_attempts).is_none());
    }
}
