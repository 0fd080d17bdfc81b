// Sliding-window rate limiting for AppView calls.
//
// The public AppView allows roughly 3000 requests per 5 minutes. The graph
// rebuild walks one getFollows call per L1 account, so it throttles itself
// through this limiter: a sliding window plus a minimum inter-call delay.
// Shared across tasks via Arc with interior mutability.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

pub struct RateLimiter {
    /// Timestamps of recent requests within the current window.
    requests: Mutex<VecDeque<Instant>>,
    max_requests: u32,
    window: Duration,
    /// Minimum delay between consecutive requests to avoid bursts.
    min_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests_per_window: u32, window_seconds: u64, min_delay_ms: u64) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            max_requests: max_requests_per_window,
            window: Duration::from_secs(window_seconds),
            min_delay: Duration::from_millis(min_delay_ms),
            last_request: Mutex::new(None),
        }
    }

    /// Limiter tuned for the public AppView's documented budget.
    pub fn for_appview() -> Self {
        Self::new(2500, 300, 150)
    }

    /// Wait until a request may be made.
    ///
    /// Enforces the minimum inter-request delay, then blocks while the
    /// sliding window is full. Locks are never held across await points —
    /// waits are computed under the lock, slept outside it.
    pub async fn acquire(&self) {
        let min_delay_wait = {
            let last = self.last_request.lock().unwrap();
            last.and_then(|t| {
                let elapsed = t.elapsed();
                (elapsed < self.min_delay).then(|| self.min_delay - elapsed)
            })
        };
        if let Some(wait) = min_delay_wait {
            tokio::time::sleep(wait).await;
        }

        loop {
            let action = {
                let now = Instant::now();
                let mut requests = self.requests.lock().unwrap();

                while let Some(&oldest) = requests.front() {
                    if now.duration_since(oldest) > self.window {
                        requests.pop_front();
                    } else {
                        break;
                    }
                }

                if (requests.len() as u32) < self.max_requests {
                    requests.push_back(now);
                    *self.last_request.lock().unwrap() = Some(now);
                    None
                } else {
                    let oldest = *requests.front().unwrap();
                    Some((oldest + self.window).duration_since(now))
                }
            };

            match action {
                None => return,
                Some(wait) => {
                    info!(
                        delay_ms = wait.as_millis() as u64,
                        "Rate limit window full, waiting"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
