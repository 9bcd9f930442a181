//! Reconciliation queue
//!
//! A deduplicating work queue of membership keys with per-key exponential
//! backoff for failed keys.
//!
//! ## Guarantees
//!
//! - A key is pending at most once: adding an already pending key is a no-op.
//! - A key handed out by [`ReconcileQueue::get`] is never handed out again
//!   before [`ReconcileQueue::done`] is called for it. Adding it in the
//!   meantime marks it dirty, and `done` puts it back exactly once.
//! - [`ReconcileQueue::shut_down`] rejects new keys, lets workers drain what
//!   is already queued, and then makes `get` return `None`. Keys still
//!   waiting out a backoff delay are dropped.
//!
//! ```text
//!  add ──► dirty? ──no──► processing? ──no──► queue ──get──► processing
//!                                 │                               │
//!                                 └──yes (parked as dirty) ◄──done┘
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Per-key exponential backoff
///
/// The delay for the n-th consecutive failure is `base * 2^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff policy
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to apply after `failures` previous failures
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    waiting: BinaryHeap<Reverse<(Instant, String)>>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl QueueState {
    /// Returns true when the key was pushed onto the ready queue
    fn enqueue(&mut self, key: String) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_ready(&mut self, now: Instant) {
        while let Some(Reverse((ready_at, _))) = self.waiting.peek() {
            if *ready_at > now {
                break;
            }
            if let Some(Reverse((_, key))) = self.waiting.pop() {
                self.enqueue(key);
            }
        }
    }
}

/// Deduplicating, rate-limited queue of membership keys
#[derive(Debug)]
pub struct ReconcileQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl ReconcileQueue {
    /// Create a queue with the given backoff policy
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    // Every mutation completes before the guard drops, so a poisoned lock
    // still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a key for immediate processing
    pub fn add(&self, key: impl Into<String>) {
        let pushed = self.lock().enqueue(key.into());
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Add a key after its backoff delay, counting one more requeue
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures += 1;
            trace!(key = %key, delay_ms = delay.as_millis() as u64, "Requeueing after backoff");
            state.waiting.push(Reverse((Instant::now() + delay, key)));
        }
        // A sleeping worker must recompute its deadline.
        self.notify.notify_one();
    }

    /// Clear the retry state of a key
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Number of rate-limited requeues since the key was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key to process
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                state.promote_ready(Instant::now());

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }

                state.waiting.peek().map(|Reverse((ready_at, _))| *ready_at)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key handed out by `get` as finished
    ///
    /// If the key was added again while being processed it becomes ready again.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.notify.notify_waiters();
    }

    /// Whether `shut_down` was called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready for processing
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is ready for processing
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}

impl Default for ReconcileQueue {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}
