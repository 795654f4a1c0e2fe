//! Frozen stream detection
//!
//! A muted inbound video track starts a grace timer; if the track is still
//! muted when it expires the stream is flagged frozen. A recurring poll
//! re-checks the muted flag for engines that miss mute events. All timers
//! live inside the peer's [`StreamHealth`], so dropping or resetting it is
//! the only cleanup there is.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct HealthTimings {
    pub grace: Duration,
    pub poll: Duration,
}

impl Default for HealthTimings {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(7500),
            poll: Duration::from_millis(3000),
        }
    }
}

/// Outcome of a health timer firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Frozen,
}

/// Per-peer monitor state
#[derive(Debug, Clone, Default)]
pub struct StreamHealth {
    monitoring: bool,
    track_muted: bool,
    grace_deadline: Option<Instant>,
    next_poll: Option<Instant>,
    frozen: bool,
}

impl StreamHealth {
    /// Begin monitoring a freshly received stream. Any previous timers are dropped.
    pub fn start(&mut self, now: Instant, timings: HealthTimings) {
        *self = StreamHealth {
            monitoring: true,
            next_poll: Some(now + timings.poll),
            ..Default::default()
        };
    }

    pub fn stop(&mut self) {
        *self = StreamHealth::default();
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn on_mute(&mut self, now: Instant, timings: HealthTimings) {
        if !self.monitoring {
            return;
        }
        self.track_muted = true;
        self.arm_grace(now, timings);
    }

    pub fn on_unmute(&mut self) {
        if !self.monitoring {
            return;
        }
        self.track_muted = false;
        self.grace_deadline = None;
        self.frozen = false;
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.grace_deadline, self.next_poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant, timings: HealthTimings) -> Option<HealthEvent> {
        let mut event = None;

        if let Some(deadline) = self.grace_deadline {
            if deadline <= now {
                self.grace_deadline = None;
                if self.track_muted && !self.frozen {
                    self.frozen = true;
                    event = Some(HealthEvent::Frozen);
                }
            }
        }

        if let Some(poll) = self.next_poll {
            if poll <= now {
                self.next_poll = Some(now + timings.poll);
                if self.track_muted {
                    self.arm_grace(now, timings);
                }
            }
        }

        event
    }

    fn arm_grace(&mut self, now: Instant, timings: HealthTimings) {
        if self.grace_deadline.is_none() && !self.frozen {
            self.grace_deadline = Some(now + timings.grace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn sustained_mute_is_flagged_frozen() {
        let t = HealthTimings::default();
        let start = Instant::now();
        let mut health = StreamHealth::default();
        health.start(start, t);
        health.on_mute(start + ms(100), t);

        // poll at 3s re-arms nothing new
        assert_eq!(health.handle_timeout(start + ms(3000), t), None);
        assert!(!health.is_frozen());

        assert_eq!(health.handle_timeout(start + ms(7600), t), Some(HealthEvent::Frozen));
        assert!(health.is_frozen());
    }

    #[test]
    fn unmute_within_grace_keeps_stream_healthy() {
        let t = HealthTimings::default();
        let start = Instant::now();
        let mut health = StreamHealth::default();
        health.start(start, t);
        health.on_mute(start, t);
        health.on_unmute();
        assert_eq!(health.handle_timeout(start + ms(8000), t), None);
        assert!(!health.is_frozen());
    }

    #[test]
    fn poll_catches_missed_mute_event() {
        let t = HealthTimings::default();
        let start = Instant::now();
        let mut health = StreamHealth::default();
        health.start(start, t);
        health.track_muted = true;

        assert_eq!(health.handle_timeout(start + ms(3000), t), None);
        assert_eq!(health.poll_timeout(), Some(start + ms(6000)));
        assert_eq!(health.handle_timeout(start + ms(10_500), t), Some(HealthEvent::Frozen));
    }

    #[test]
    fn restart_drops_previous_timers() {
        let t = HealthTimings::default();
        let start = Instant::now();
        let mut health = StreamHealth::default();
        health.start(start, t);
        health.on_mute(start, t);
        health.start(start + ms(1000), t);
        assert_eq!(health.poll_timeout(), Some(start + ms(4000)));
        health.stop();
        assert_eq!(health.poll_timeout(), None);
        assert!(!health.is_monitoring());
    }

    #[test]
    fn events_ignored_when_not_monitoring() {
        let t = HealthTimings::default();
        let mut health = StreamHealth::default();
        health.on_mute(Instant::now(), t);
        assert_eq!(health.poll_timeout(), None);
    }
}
