//! Run-wide fetch throttle: bounded concurrency plus a requests-per-minute ceiling.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

pub struct FetchThrottle {
    semaphore: Arc<Semaphore>,
    min_spacing: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl FetchThrottle {
    /// `rate_per_minute == 0` disables the rate ceiling; concurrency is at least 1.
    pub fn new(concurrency: usize, rate_per_minute: u32) -> Self {
        let min_spacing = if rate_per_minute == 0 {
            Duration::ZERO
        } else {
            // Rounded up: at most `rate_per_minute` starts fit in any 60s window.
            Duration::from_millis(60_000_u64.div_ceil(u64::from(rate_per_minute)))
        };

        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            min_spacing,
            last_start: Mutex::new(None),
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot and for the rate window, then hand out a guard
    /// that frees the slot when dropped.
    pub async fn acquire(&self) -> ThrottleGuard {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("fetch throttle semaphore is never closed");

        // Holding the lock while sleeping serializes request starts.
        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_spacing {
                let wait = self.min_spacing - elapsed;
                debug!("Throttling fetch for {}ms", wait.as_millis());
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());

        ThrottleGuard { _permit: permit }
    }
}

/// Releases the throttle slot when dropped.
pub struct ThrottleGuard {
    _permit: OwnedSemaphorePermit,
}
