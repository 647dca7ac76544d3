//! Sliding-window token bucket per external API family. Grounded directly
//! on the teacher's `scrapers/polymarket_api.rs::RateLimiter`.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

pub struct RateLimiter {
    requests_per_window: u32,
    window: Duration,
    inner: Mutex<State>,
}

struct State {
    current_requests: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_window: u32, window: Duration) -> Self {
        RateLimiter {
            requests_per_window,
            window,
            inner: Mutex::new(State {
                current_requests: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn per_10s(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(10))
    }

    /// Block until a slot is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                let elapsed = state.window_start.elapsed();
                if elapsed >= self.window {
                    state.window_start = Instant::now();
                    state.current_requests = 0;
                }
                if state.current_requests < self.requests_per_window {
                    state.current_requests += 1;
                    None
                } else {
                    Some(self.window - elapsed)
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_bursts_up_to_the_limit() {
        let limiter = RateLimiter::new(3, Duration::from_millis(200));
        for _ in 0..3 {
            limiter.acquire().await;
        }
    }
}
