//! Periodic timers for the cooperative tick loop.
//!
//! Timers never fire on their own. Every layer polls its timers from
//! `iterate(now)`, so a deadline is honoured at the first tick after it
//! passes.

use std::time::{Duration, Instant};

/// Repeating deadline.
#[derive(Debug, Clone)]
pub struct Interval {
    period: Duration,
    next: Option<Instant>,
}

impl Interval {
    /// New interval that is due on its first poll
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    /// New interval whose first deadline is one period after `now`
    #[must_use]
    pub fn starting_at(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: Some(now + period),
        }
    }

    /// Returns `true` if the deadline passed, and schedules the next one.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next {
            Some(deadline) if now < deadline => false,
            _ => {
                self.next = Some(now + self.period);
                true
            }
        }
    }

    /// Push the next deadline one period past `now`
    pub fn reset(&mut self, now: Instant) {
        self.next = Some(now + self.period);
    }

    /// Make the next poll fire
    pub fn trigger(&mut self) {
        self.next = None;
    }

    /// Timer period
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Next deadline, if scheduled
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next
    }
}

/// `true` if at least `timeout` elapsed between `since` and `now`
#[must_use]
pub fn is_timeout(since: Instant, timeout: Duration, now: Instant) -> bool {
    now.saturating_duration_since(since) >= timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_poll_fires() {
        let now = Instant::now();
        let mut interval = Interval::new(Duration::from_secs(5));
        assert!(interval.poll(now));
        assert!(!interval.poll(now));
        assert!(!interval.poll(now + Duration::from_secs(4)));
        assert!(interval.poll(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_starting_at_waits_one_period() {
        let now = Instant::now();
        let mut interval = Interval::starting_at(Duration::from_secs(2), now);
        assert!(!interval.poll(now));
        assert!(interval.poll(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_trigger_and_reset() {
        let now = Instant::now();
        let mut interval = Interval::new(Duration::from_secs(10));
        assert!(interval.poll(now));
        interval.trigger();
        assert!(interval.poll(now));
        interval.reset(now + Duration::from_secs(1));
        assert_eq!(
            interval.next_deadline(),
            Some(now + Duration::from_secs(11))
        );
    }

    #[test]
    fn test_is_timeout() {
        let now = Instant::now();
        assert!(!is_timeout(now, Duration::from_secs(1), now));
        assert!(is_timeout(now, Duration::from_secs(1), now + Duration::from_secs(1)));
        // A `since` in the future never times out
        assert!(!is_timeout(now + Duration::from_secs(5), Duration::from_millis(1), now));
    }
}
