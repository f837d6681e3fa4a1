// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sliding-window rate shaping for job starts.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Admits at most `max` acquisitions per sliding `window`.
///
/// [`acquire`](Self::acquire) waits until a slot frees up, so a burst of
/// deliveries is smeared across the window instead of rejected. The
/// limiter tracks acquisition timestamps and prunes those older than the
/// window on every call.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    max: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowRateLimiter {
    /// Create a limiter admitting `max` acquisitions per `window`.
    #[must_use]
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max as usize,
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a slot, waiting as long as necessary.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                Self::prune(&mut starts, now, self.window);
                if starts.len() < self.max {
                    starts.push_back(now);
                    return;
                }
                // Oldest entry leaving the window frees the next slot.
                starts[0] + self.window
            };
            trace!(target: "texd.queue", "rate limit reached, waiting for a slot");
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Take a slot only if one is free right now.
    pub async fn try_acquire(&self) -> bool {
        let mut starts = self.starts.lock().await;
        let now = Instant::now();
        Self::prune(&mut starts, now, self.window);
        if starts.len() < self.max {
            starts.push_back(now);
            true
        } else {
            false
        }
    }

    /// Slots currently taken within the window.
    pub async fn in_flight(&self) -> usize {
        let mut starts = self.starts.lock().await;
        let now = Instant::now();
        Self::prune(&mut starts, now, self.window);
        starts.len()
    }

    fn prune(starts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = starts.front() {
            if now.duration_since(oldest) >= window {
                starts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_max_immediately() {
        let limiter = SlidingWindowRateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
        assert_eq!(limiter.in_flight().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_as_the_window_slides() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.try_acquire().await);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        // First slot expires at t=10.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_the_oldest_slot() {
        let limiter = SlidingWindowRateLimiter::new(1, Duration::from_secs(30));
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        let waited = Instant::now().duration_since(start);
        assert!(waited >= Duration::from_secs(30), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_smeared_not_rejected() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // Slots at 0s, 0s, 10s, 10s.
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(21));
    }
}
