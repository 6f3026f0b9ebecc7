//! Minimum-interval throttle with a trailing edge.
//!
//! The first offer after a quiet period fires immediately. Offers inside the
//! window collapse into a single trailing fire at the end of the window,
//! carrying the most recent item.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    last_fire: Option<Instant>,
    pending: Option<(Instant, T)>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fire: None,
            pending: None,
        }
    }

    /// Offer `item` at `now`. Returns it back if it should fire right away.
    pub fn offer(&mut self, now: Instant, item: T) -> Option<T> {
        if let Some((deadline, _)) = self.pending.take() {
            self.pending = Some((deadline, item));
            return None;
        }
        match self.last_fire {
            Some(last) if now < last + self.window => {
                self.pending = Some((last + self.window, item));
                None
            }
            _ => {
                self.last_fire = Some(now);
                Some(item)
            }
        }
    }

    /// When the pending trailing fire is due.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(deadline, _)| *deadline)
    }

    /// Take the pending item if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((deadline, _)) if *deadline <= now => {
                self.last_fire = Some(now);
                self.pending.take().map(|(_, item)| item)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn test_first_offer_fires_immediately() {
        let mut t = Throttle::new(WINDOW);
        let now = Instant::now();
        assert_eq!(t.offer(now, 1), Some(1));
        assert!(t.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_last_wins() {
        let mut t = Throttle::new(WINDOW);
        let start = Instant::now();
        assert_eq!(t.offer(start, 1), Some(1));

        assert_eq!(t.offer(start + Duration::from_millis(100), 2), None);
        assert_eq!(t.offer(start + Duration::from_millis(200), 3), None);
        assert_eq!(t.offer(start + Duration::from_millis(900), 4), None);
        assert_eq!(t.deadline(), Some(start + WINDOW));

        assert_eq!(t.take_due(start + Duration::from_millis(999)), None);
        assert_eq!(t.take_due(start + WINDOW), Some(4));
        assert!(t.deadline().is_none());

        // The trailing fire opens a new window.
        assert_eq!(t.offer(start + Duration::from_millis(1500), 5), None);
        assert_eq!(t.deadline(), Some(start + WINDOW * 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_resets() {
        let mut t = Throttle::new(WINDOW);
        let start = Instant::now();
        assert_eq!(t.offer(start, "a"), Some("a"));
        assert_eq!(t.offer(start + WINDOW, "b"), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending() {
        let mut t = Throttle::new(WINDOW);
        let start = Instant::now();
        t.offer(start, 1);
        t.offer(start + Duration::from_millis(10), 2);
        t.cancel();
        assert_eq!(t.take_due(start + WINDOW * 3), None);
    }
}
