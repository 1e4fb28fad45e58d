use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Enforces a minimum spacing between successive submissions.
///
/// Slots are handed out under a short lock; the wait happens after the lock
/// is released.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    interval: Duration,
    next_slot: Option<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                interval,
                next_slot: None,
            }),
        }
    }

    pub(crate) fn set_interval(&self, interval: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.interval = interval;
        }
    }

    /// Reserve the next slot and return when it is due.
    fn reserve(&self) -> Instant {
        let now = Instant::now();
        let Ok(mut state) = self.state.lock() else {
            return now;
        };
        let at = state.next_slot.map_or(now, |slot| slot.max(now));
        state.next_slot = Some(at + state.interval);
        at
    }

    /// Wait for the next submission slot.
    pub(crate) async fn until_ready(&self) {
        let at = self.reserve();
        if at > Instant::now() {
            tokio::time::sleep_until(at).await;
        }
    }
}

/// One limiter per master task.
#[derive(Debug, Default)]
pub(crate) struct RateLimiters {
    by_master: Mutex<HashMap<Uuid, Arc<RateLimiter>>>,
}

impl RateLimiters {
    /// The limiter of `master_id`, created or re-tuned to `interval`.
    pub(crate) fn get(&self, master_id: Uuid, interval: Duration) -> Arc<RateLimiter> {
        let Ok(mut map) = self.by_master.lock() else {
            return Arc::new(RateLimiter::new(interval));
        };
        let limiter = map
            .entry(master_id)
            .or_insert_with(|| Arc::new(RateLimiter::new(interval)));
        limiter.set_interval(interval);
        limiter.clone()
    }

    pub(crate) fn remove(&self, master_id: Uuid) {
        if let Ok(mut map) = self.by_master.lock() {
            map.remove(&master_id);
        }
    }
}
