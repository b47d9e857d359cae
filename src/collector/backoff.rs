use std::time::Duration;

use rand::random_range;

/// Restart delay policy for the local collector.
///
/// - Every unplanned exit increments `attempt`
/// - The next `READY` resets it to 0
/// - Normal attempts sleep `random(0, min(max, base * 2^attempt))`
/// - Every `probe_every`-th attempt sleeps `probe_cooldown ± random(0, max)`
///
/// There is no give-up point. A persistently broken collector keeps
/// being retried, the probe cooldown only spaces the retries out.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    probe_cooldown: Duration,
    probe_every: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, probe_cooldown: Duration, probe_every: u32) -> Self {
        Self {
            base,
            max,
            probe_cooldown,
            probe_every: probe_every.max(1),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Records an unplanned exit and returns how long to wait before
    /// the next spawn.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    pub fn is_probe(&self, attempt: u32) -> bool {
        attempt > 0 && attempt % self.probe_every == 0
    }

    /// Upper bound of the exponential range for `attempt`.
    pub fn cap_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let max_ms = self.max.as_millis() as u64;

        if self.is_probe(attempt) {
            let cooldown_ms = self.probe_cooldown.as_millis() as u64;
            let jitter = random_range(0..=max_ms);

            let ms = if random_range(0..2u8) == 0 {
                cooldown_ms.saturating_sub(jitter)
            } else {
                cooldown_ms.saturating_add(jitter)
            };
            return Duration::from_millis(ms);
        }

        let cap_ms = self.cap_for(attempt).as_millis() as u64;
        Duration::from_millis(random_range(0..=cap_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> Backoff {
        Backoff::new(
            Duration::from_millis(1500),
            Duration::from_secs(30),
            Duration::from_secs(300),
            10,
        )
    }

    #[test]
    fn cap_doubles_until_max() {
        let b = standard();
        assert_eq!(b.cap_for(0), Duration::from_millis(1500));
        assert_eq!(b.cap_for(1), Duration::from_millis(3000));
        assert_eq!(b.cap_for(3), Duration::from_millis(12000));
        assert_eq!(b.cap_for(5), Duration::from_secs(30));
        assert_eq!(b.cap_for(40), Duration::from_secs(30));
    }

    #[test]
    fn consecutive_exits_stay_bounded_except_probes() {
        let mut b = standard();

        for _ in 0..35 {
            let delay = b.next_delay();
            let attempt = b.attempt();

            if attempt % 10 == 0 {
                assert!(delay >= Duration::from_secs(270), "probe {attempt}: {delay:?}");
                assert!(delay <= Duration::from_secs(330), "probe {attempt}: {delay:?}");
            } else {
                assert!(delay <= b.cap_for(attempt), "attempt {attempt}: {delay:?}");
                assert!(delay <= Duration::from_secs(30));
            }
        }
    }

    #[test]
    fn tenth_exit_after_nine_takes_cooldown_branch() {
        let mut b = standard();
        for _ in 0..9 {
            b.next_delay();
        }
        assert_eq!(b.attempt(), 9);
        assert!(!b.is_probe(9));

        let delay = b.next_delay();
        assert_eq!(b.attempt(), 10);
        assert!(b.is_probe(10));
        assert!(delay >= Duration::from_secs(270));
    }

    #[test]
    fn reset_returns_to_smallest_range() {
        let mut b = standard();
        for _ in 0..6 {
            b.next_delay();
        }

        b.reset();
        assert_eq!(b.attempt(), 0);

        for _ in 0..50 {
            let mut probe = b.clone();
            assert!(probe.next_delay() <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn probe_never_goes_negative() {
        let mut b = Backoff::new(
            Duration::from_millis(10),
            Duration::from_secs(30),
            Duration::from_secs(1),
            1,
        );

        for _ in 0..20 {
            assert!(b.next_delay() <= Duration::from_secs(31));
        }
    }
}
