use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ThrottleConfig;

/// Per-worker rate check over a rolling window.
///
/// Each worker owns one, so no locking is involved.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_sec: Option<f64>,
    window: Duration,
    pause: Duration,
    recent: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            max_per_sec: config.max_docs_per_sec.filter(|rate| *rate > 0.0),
            window: Duration::from_millis(config.window_ms.max(1)),
            pause: Duration::from_millis(config.pause_ms),
            recent: VecDeque::new(),
        }
    }

    /// Note one processed document. Returns how long to pause when the rate
    /// over the window is above the limit.
    pub fn record(&mut self) -> Option<Duration> {
        self.record_at(Instant::now())
    }

    fn record_at(&mut self, now: Instant) -> Option<Duration> {
        let max = self.max_per_sec?;
        self.recent.push_back(now);
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        let rate = self.recent.len() as f64 / self.window.as_secs_f64();
        if rate > max {
            self.recent.clear();
            Some(self.pause)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: Option<f64>) -> RateLimiter {
        RateLimiter::new(&ThrottleConfig {
            max_docs_per_sec: max,
            window_ms: 1000,
            pause_ms: 250,
        })
    }

    #[test]
    fn disabled_without_limit() {
        let mut l = limiter(None);
        for _ in 0..1000 {
            assert!(l.record().is_none());
        }
    }

    #[test]
    fn pauses_when_window_rate_exceeds_limit() {
        let mut l = limiter(Some(3.0));
        let start = Instant::now();
        assert!(l.record_at(start).is_none());
        assert!(l.record_at(start + Duration::from_millis(10)).is_none());
        assert!(l.record_at(start + Duration::from_millis(20)).is_none());
        assert_eq!(
            l.record_at(start + Duration::from_millis(30)),
            Some(Duration::from_millis(250))
        );
        // The window restarts after a pause.
        assert!(l.record_at(start + Duration::from_millis(40)).is_none());
    }

    #[test]
    fn old_entries_leave_the_window() {
        let mut l = limiter(Some(2.0));
        let start = Instant::now();
        assert!(l.record_at(start).is_none());
        assert!(l.record_at(start + Duration::from_millis(100)).is_none());
        assert!(l.record_at(start + Duration::from_millis(1500)).is_none());
    }
}
