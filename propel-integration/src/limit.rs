use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

/// Local sliding-window rate limiter allowing `capacity` acquisitions per `window`.
///
/// Serves as the degraded-mode fallback when the shared counter store is unreachable: checks
/// are synchronous and never queue, callers that exceed the window are rejected immediately.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Construct a new [`SlidingWindow`] allowing `capacity` operations every `window`.
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            hits: VecDeque::with_capacity(capacity),
        }
    }

    /// Attempt to acquire a permit now, returning `false` if the window is exhausted.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Attempt to acquire a permit at the provided instant.
    ///
    /// Instant injection keeps the window deterministic under test.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.hits.front() {
            if now.duration_since(front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        if self.hits.len() < self.capacity {
            self.hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Forget all recorded acquisitions, eg/ after the shared counter store reconverges.
    pub fn reset(&mut self) {
        self.hits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_window_rejects_when_exhausted() {
        let mut window = SlidingWindow::new(10, Duration::from_secs(1));
        let now = Instant::now();

        for i in 0..12 {
            let acquired = window.try_acquire_at(now);
            if i < 10 {
                assert!(acquired, "acquisition {i} should succeed");
            } else {
                assert!(!acquired, "acquisition {i} should be rejected");
            }
        }
    }

    #[test]
    fn test_sliding_window_refills_after_window_elapses() {
        let mut window = SlidingWindow::new(2, Duration::from_millis(100));
        let now = Instant::now();

        assert!(window.try_acquire_at(now));
        assert!(window.try_acquire_at(now));
        assert!(!window.try_acquire_at(now));

        let later = now + Duration::from_millis(101);
        assert!(window.try_acquire_at(later));
    }

    #[test]
    fn test_sliding_window_reset() {
        let mut window = SlidingWindow::new(1, Duration::from_secs(1));
        let now = Instant::now();

        assert!(window.try_acquire_at(now));
        assert!(!window.try_acquire_at(now));

        window.reset();
        assert!(window.try_acquire_at(now));
    }
}
