use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Backoff state for one reflector. `attempt` grows on every delay handed out
/// and goes back to zero on [`reset`](Backoff::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self { Self { cfg, attempt: 0 } }

    pub fn attempt(&self) -> u32 { self.attempt }

    pub fn reset(&mut self) { self.attempt = 0; }

    /// `min(initial * 2^attempt, max)`, minus up to `jitter` of itself.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.cfg.initial_ms.saturating_mul(2u64.saturating_pow(self.attempt));
        let capped = exp.min(self.cfg.max_ms);
        let range = capped as f64 * self.cfg.jitter.clamp(0.0, 1.0);
        let shave = if range >= 1.0 { rand::thread_rng().gen_range(0.0..range) as u64 } else { 0 };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(capped.saturating_sub(shave))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(initial_ms: u64, max_ms: u64, jitter: f64) -> BackoffConfig { BackoffConfig { initial_ms, max_ms, jitter } }

    #[test]
    fn doubles_until_ceiling_without_jitter() {
        let mut b = Backoff::new(cfg(100, 1_000, 0.0));
        let got: Vec<u64> = (0..6).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(got, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(b.attempt(), 6);
    }

    #[test]
    fn jitter_never_exceeds_ceiling() {
        let mut b = Backoff::new(cfg(50, 400, 0.5));
        for _ in 0..64 {
            let d = b.next_delay();
            assert!(d <= Duration::from_millis(400), "delay {:?} above ceiling", d);
        }
    }

    #[test]
    fn jittered_delay_stays_within_band() {
        let mut b = Backoff::new(cfg(1_000, 1_000, 0.25));
        for _ in 0..32 {
            let ms = b.next_delay().as_millis() as u64;
            assert!((750..=1_000).contains(&ms), "got {}", ms);
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut b = Backoff::new(cfg(10, 10_000, 0.0));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let mut b = Backoff::new(cfg(u64::MAX / 2, u64::MAX, 0.0));
        for _ in 0..100 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_millis(u64::MAX));
    }
}
