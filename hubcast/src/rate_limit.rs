use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::model::ChatId;

/// Spaces requests to one remote host at least `interval` apart, across all callers.
pub struct RequestPacer {
    interval: Duration,
    next_slot: tokio::sync::Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserves the next free slot and sleeps until it starts.
    pub async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        if slot > Instant::now() {
            debug!(wait_ms = (slot - Instant::now()).as_millis() as u64, "pacer: waiting for slot");
        }
        tokio::time::sleep_until(slot).await;
    }
}

/// Sliding-window limit per chat: at most `max_requests` within `window`.
pub struct UserRateLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<HashMap<ChatId, VecDeque<Instant>>>,
}

impl UserRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1) as usize,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Records a request for `chat` if allowed, otherwise returns how long to wait.
    pub fn check(&self, chat: ChatId) -> Result<(), Duration> {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let history = requests.entry(chat).or_default();
        while history.front().map_or(false, |t| now.duration_since(*t) >= self.window) {
            history.pop_front();
        }

        if history.len() >= self.max_requests {
            let oldest = history.front().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.duration_since(oldest)));
        }
        history.push_back(now);
        Ok(())
    }

    /// Drops chats with no request inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        requests.retain(|_, history| {
            history.retain(|t| now.duration_since(*t) < self.window);
            !history.is_empty()
        });
    }

    pub fn tracked_chats(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
