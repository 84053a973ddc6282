//! A per-item work queue with exponential-backoff requeues.
//!
//! Mirrors the usual controller workqueue contract: an item is present at
//! most once, an item re-added while being processed is queued again after
//! `done`, and failed items come back after `base_delay * 2^failures`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// Default delay before the first rate-limited retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);

/// Cap on the backoff exponent so the delay stays bounded.
const MAX_BACKOFF_EXPONENT: u32 = 10;

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

/// A rate-limited, deduplicating work queue of string keys.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
    base_delay: Duration,
    // Handle to ourselves for the delayed-requeue tasks. A dropped queue
    // simply loses its pending delays.
    me: Weak<WorkQueue>,
}

impl WorkQueue {
    /// Creates a queue with the standard 30s base retry delay.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_base_delay(DEFAULT_BASE_DELAY)
    }

    /// Creates a queue with a custom base retry delay.
    #[must_use]
    pub fn with_base_delay(base_delay: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            base_delay,
            me: me.clone(),
        })
    }

    /// Adds a key for processing. Keys already queued are not duplicated;
    /// keys currently being processed are queued again once `done` is
    /// called for them.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.order.push_back(key.to_string());
            drop(state);
            self.wakeup.notify_one();
        }
    }

    /// Re-adds a key after its failure-count-based backoff delay and
    /// increments the failure count.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let exponent = (*failures).min(MAX_BACKOFF_EXPONENT);
            *failures += 1;
            self.base_delay * 2u32.pow(exponent)
        };

        trace!(key, delay_ms = delay.as_millis() as u64, "delaying requeue");
        let queue = self.me.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add(&key);
            }
        });
    }

    /// Number of times the key has been requeued with backoff since it was
    /// last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Clears the failure history of the key.
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Awaits the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            self.wakeup.notified().await;
        }
    }

    /// Marks processing of the key as finished. A key re-added while it was
    /// being processed is queued again.
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.to_string())
            {
                state.order.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeue {
            self.wakeup.notify_one();
        }
    }

    /// Shuts the queue down: pending keys are still handed out, new adds are
    /// dropped, and `get` returns `None` once drained.
    pub fn shut_down(&self) {
        self.state.lock().shut_down = true;
        self.wakeup.notify_waiters();
    }
}
