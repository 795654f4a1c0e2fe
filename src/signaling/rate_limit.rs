//! Pre-emptive boot limiter
//!
//! Booting someone who is not watching us is free a handful of times, then
//! costs a cooldown per boot. One limiter per local user, not per target.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BootRateLimiter {
    max_free: u32,
    cooldown: Duration,
    counter: u32,
    cooldown_until: Option<Instant>,
}

impl BootRateLimiter {
    pub fn new(max_free: u32, cooldown: Duration) -> Self {
        Self {
            max_free,
            cooldown,
            counter: 0,
            cooldown_until: None,
        }
    }

    /// Check whether a boot may proceed, and record it if `commit` is set.
    ///
    /// Boots of current viewers are never limited. Returns the remaining
    /// wait when the cooldown is still running.
    pub fn check(&mut self, now: Instant, target_watching: bool, commit: bool) -> Result<(), Duration> {
        if target_watching {
            return Ok(());
        }

        if self.counter < self.max_free {
            if !commit {
                return Ok(());
            }
            self.counter += 1;
        }

        if self.counter >= self.max_free {
            if let Some(until) = self.cooldown_until {
                if now < until {
                    return Err(until - now);
                }
            }
            if commit {
                self.cooldown_until = Some(now + self.cooldown);
            }
        }

        Ok(())
    }

    /// Check then commit, the way a boot action uses the limiter.
    pub fn try_boot(&mut self, now: Instant, target_watching: bool) -> Result<(), Duration> {
        self.check(now, target_watching, false)?;
        self.check(now, target_watching, true)
    }

    pub fn boots_used(&self) -> u32 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_boots_then_cooldown() {
        let start = Instant::now();
        let mut limiter = BootRateLimiter::new(2, Duration::from_secs(60));

        assert!(limiter.try_boot(start, false).is_ok());
        assert!(limiter.try_boot(start + Duration::from_secs(1), false).is_ok());

        let wait = limiter.try_boot(start + Duration::from_secs(2), false).unwrap_err();
        assert!(wait > Duration::ZERO);
        assert_eq!(wait, Duration::from_secs(59));

        let later = start + Duration::from_secs(62);
        assert!(limiter.try_boot(later, false).is_ok());
        // timer was reset by the last boot
        assert!(limiter.try_boot(later + Duration::from_secs(10), false).is_err());
        assert!(limiter.try_boot(later + Duration::from_secs(61), false).is_ok());
    }

    #[test]
    fn watching_targets_are_never_limited() {
        let now = Instant::now();
        let mut limiter = BootRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.try_boot(now, true).is_ok());
        }
        assert_eq!(limiter.boots_used(), 0);
    }

    #[test]
    fn refused_boot_does_not_count() {
        let now = Instant::now();
        let mut limiter = BootRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_boot(now, false).is_ok());
        assert!(limiter.try_boot(now, false).is_err());
        assert!(limiter.try_boot(now, false).is_err());
        assert_eq!(limiter.boots_used(), 1);
    }
}
