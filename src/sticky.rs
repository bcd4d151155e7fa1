//! Sliding-window bookkeeping of sticky-header usage.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracks what share of recent requests presented the sticky instance header.
pub struct StickyStats {
    window: Duration,
    events: Mutex<VecDeque<(Instant, bool)>>,
}

impl StickyStats {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a request arrival, noting whether it carried the sticky header.
    pub fn record(&self, sticky: bool) {
        let mut events = self.events.lock().unwrap();
        events.push_back((Instant::now(), sticky));
        Self::prune(&mut events, self.window);
    }

    /// Percentage of requests with the sticky header over the window, or
    /// `-1.0` when nothing has been recorded.
    pub fn percent(&self) -> f64 {
        let mut events = self.events.lock().unwrap();
        Self::prune(&mut events, self.window);
        if events.is_empty() {
            return -1.0;
        }
        let sticky = events.iter().filter(|(_, s)| *s).count();
        sticky as f64 / events.len() as f64 * 100.0
    }

    fn prune(events: &mut VecDeque<(Instant, bool)>, window: Duration) {
        let now = Instant::now();
        while let Some((at, _)) = events.front() {
            if now.duration_since(*at) <= window {
                break;
            }
            events.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_sentinel() {
        let stats = StickyStats::new(Duration::from_secs(60));
        assert_eq!(stats.percent(), -1.0);
    }

    #[test]
    fn percent_over_mixed_requests() {
        let stats = StickyStats::new(Duration::from_secs(60));
        stats.record(true);
        stats.record(true);
        stats.record(false);
        stats.record(false);
        assert_eq!(stats.percent(), 50.0);
    }

    #[test]
    fn old_events_age_out() {
        let stats = StickyStats::new(Duration::from_millis(0));
        stats.record(true);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.percent(), -1.0);
    }
}
