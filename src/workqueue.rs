// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Key-deduplicating, rate-limited work queue.
//!
//! The queue enforces single-flight per key: a key handed to a worker is
//! not handed out again until the worker calls [`WorkQueue::done`], and a
//! key re-added while in flight is delivered exactly once afterwards.
//! Distinct keys are processed fully in parallel. Failed keys are re-added
//! through [`WorkQueue::add_rate_limited`] with capped exponential
//! per-key backoff, reset by [`WorkQueue::forget`] on success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Default delay after the first failure of a key.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default cap on the per-key requeue delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shut_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

/// A work queue of reconciliation keys. Cheap to clone; clones share the
/// same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue with the default rate limiter.
    pub fn new() -> Self {
        Self::with_rate_limit(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Creates a queue with the given backoff base and cap.
    pub fn with_rate_limit(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.inner.state.lock().expect("workqueue mutex poisoned")
    }

    /// Enqueues a key. A key already waiting, or already re-marked while
    /// in flight, is not enqueued twice.
    pub fn add(&self, key: K) {
        {
            let mut state = self.lock();
            if state.shut_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // Re-delivered by done() once the current sync finishes.
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Re-enqueues a failed key after its per-key backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            let exponent = (*failures - 1).min(16);
            self.inner
                .base_delay
                .saturating_mul(1 << exponent)
                .min(self.inner.max_delay)
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the failure history of a key after a successful sync.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Returns how many times the key has failed since it was last
    /// forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Hands out the next key, waiting if the queue is empty. Returns
    /// `None` once the queue is shut down and drained.
    pub async fn next(&self) -> Option<K> {
        loop {
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    // Cascade the wakeup so every blocked worker drains.
                    self.inner.notify.notify_one();
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks a key's sync as finished. If the key was re-added while in
    /// flight it is queued again immediately.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shut_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting (not counting in-flight keys).
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue: pending keys are still drained, waiting workers
    /// unblock with `None` once the queue is empty, and new adds are
    /// ignored.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_next() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.next().await, Some("a".to_string()));
        assert_eq!(queue.next().await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".to_string());
        queue.add("a".to_string());
        assert_eq!(queue.next().await, Some("a".to_string()));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_single_flight_per_key() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".to_string());
        let key = queue.next().await.unwrap();

        // Re-added while in flight: not delivered until done().
        queue.add("a".to_string());
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.next().await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_workers() {
        let queue: WorkQueue<String> = WorkQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        queue.shut_down();
        assert_eq!(worker.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_keys() {
        let queue: WorkQueue<String> = WorkQueue::new();
        queue.add("a".to_string());
        queue.shut_down();
        assert_eq!(queue.next().await, Some("a".to_string()));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows_and_resets() {
        let queue: WorkQueue<String> =
            WorkQueue::with_rate_limit(Duration::from_millis(10), Duration::from_millis(40));

        queue.add_rate_limited("a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 1);
        assert_eq!(queue.next().await, Some("a".to_string()));
        queue.done(&"a".to_string());

        queue.add_rate_limited("a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 2);
        assert_eq!(queue.next().await, Some("a".to_string()));
        queue.done(&"a".to_string());

        queue.forget(&"a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 0);
    }
}
