//! Byte-rate limiting for downloads
//!
//! A [`Throttle`] may be owned by one transfer (per-book speed cap) or shared
//! through an `Arc` by every transfer of a [`DownloadManager`](super::DownloadManager)
//! (aggregate cap). Reads are delayed, never dropped.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// After this much idle time, unused budget is forgotten instead of bursting
const IDLE_RESET: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Throttle {
    bytes_per_second: u64,
    state: Mutex<ThrottleState>,
}

#[derive(Debug)]
struct ThrottleState {
    window_start: Instant,
    consumed: u64,
}

impl Throttle {
    /// A rate of zero disables throttling
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            state: Mutex::new(ThrottleState {
                window_start: Instant::now(),
                consumed: 0,
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.bytes_per_second
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_second == 0
    }

    /// Account for `bytes` just received and wait until the rate allows more
    pub async fn consume(&self, bytes: u64) {
        if self.is_unlimited() || bytes == 0 {
            return;
        }

        let deadline = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let due = state.window_start + self.budget_time(state.consumed);
            if now > due + IDLE_RESET {
                state.window_start = now;
                state.consumed = 0;
            }
            state.consumed += bytes;
            state.window_start + self.budget_time(state.consumed)
        };

        tokio::time::sleep_until(deadline).await;
    }

    fn budget_time(&self, bytes: u64) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64)
    }
}
