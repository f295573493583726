// =============================================================================
// Sliding-window rate limiter for brokerage requests
// =============================================================================
//
// The brokerage rejects sessions that exceed 5 requests per second, counted
// across queries and orders alike, so both dispatch queues share one
// limiter. `wait_if_needed` sleeps until the oldest call in the window
// expires (plus a small slack) rather than failing the request.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// Admissions per window for request dispatch.
pub const MAX_CALLS_PER_SECOND: usize = 5;
/// Safety margin added to each computed sleep.
const SLACK: Duration = Duration::from_millis(50);

pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls,
            period,
            calls: Mutex::new(VecDeque::with_capacity(max_calls + 1)),
        }
    }

    /// The dispatcher's configuration: 5 calls per second.
    pub fn for_dispatch() -> Self {
        Self::new(MAX_CALLS_PER_SECOND, Duration::from_secs(1))
    }

    /// Block the caller (asynchronously) until one more admission is legal,
    /// then record it.
    pub async fn wait_if_needed(&self) {
        loop {
            let sleep_for = {
                let mut calls = self.calls.lock();
                let now = Instant::now();
                while calls
                    .front()
                    .map(|&t| now.duration_since(t) >= self.period)
                    .unwrap_or(false)
                {
                    calls.pop_front();
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                // Oldest call leaves the window at front + period.
                let front = *calls.front().expect("window is full");
                (front + self.period).saturating_duration_since(now) + SLACK
            };
            trace!(?sleep_for, "rate limiter backoff");
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Admissions currently inside the window (diagnostics).
    pub fn in_window(&self) -> usize {
        let mut calls = self.calls.lock();
        let now = Instant::now();
        while calls
            .front()
            .map(|&t| now.duration_since(t) >= self.period)
            .unwrap_or(false)
        {
            calls.pop_front();
        }
        calls.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_without_waiting() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait_if_needed().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.in_window(), 3);
    }

    #[tokio::test]
    async fn blocks_when_window_is_full() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100));
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;

        let start = Instant::now();
        limiter.wait_if_needed().await;
        // Third admission had to wait out the first one's window.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn window_drains_over_time() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(limiter.in_window(), 0);
    }
}
