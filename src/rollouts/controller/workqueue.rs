/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Deduplicating, rate-limited work queue.
//!
//! An item is in at most one of two places: waiting in the queue or being
//! processed. Adding an item already waiting is a no-op; adding one that is
//! being processed marks it dirty so it is queued again once [`WorkQueue::done`]
//! is called. No two workers ever hold the same item at the same time.

use crate::rollouts::observability::metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    ready: Notify,
    idle: Notify,
    delayed: CancellationToken,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &str) -> Self {
        Self::with_rate_limits(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Per-item exponential backoff: the n-th consecutive failure waits
    /// `base_delay * 2^(n-1)`, capped at `max_delay`.
    pub fn with_rate_limits(name: &str, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                idle: Notify::new(),
                delayed: CancellationToken::new(),
                base_delay,
                max_delay: max_delay.max(base_delay),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        self.publish_depth(&state);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Adds `item` once `delay` has elapsed. Pending delayed adds are dropped
    /// when the queue shuts down.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.add(item);
            return;
        };
        let queue = self.clone();
        let cancelled = self.inner.delayed.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = sleep(delay) => queue.add(item),
            }
        });
    }

    /// Requeues `item` after its next backoff interval.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let exponent = *failures;
            *failures = failures.saturating_add(1);
            backoff_for(self.inner.base_delay, self.inner.max_delay, exponent)
        };
        metrics::record_workqueue_retry(&self.inner.name);
        self.add_after(item, delay);
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// shut down and empty.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.publish_depth(&state);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as processed, queueing it again if it was re-added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        let requeued = if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.publish_depth(&state);
            true
        } else {
            false
        };
        let idle = state.processing.is_empty();
        drop(state);
        if requeued {
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.delayed.cancel();
        self.inner.ready.notify_waiters();
    }

    /// Shuts the queue down and waits for items being processed to finish.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            idle.await;
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    fn publish_depth(&self, state: &QueueState<T>) {
        metrics::set_workqueue_depth(&self.inner.name, state.queue.len());
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn backoff_for(base: Duration, max: Duration, exponent: u32) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new("test-dedup");
        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        queue.add("ns/b".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn item_added_while_processing_is_requeued_after_done() {
        let queue = WorkQueue::new("test-processing");
        queue.add("ns/a".to_string());
        let item = queue.get().await.expect("item");

        queue.add(item.clone());
        assert!(queue.is_empty(), "item must not be handed out twice");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(item));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(5);
        let max = Duration::from_millis(100);
        assert_eq!(backoff_for(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff_for(base, max, 2), Duration::from_millis(20));
        assert_eq!(backoff_for(base, max, 10), max);
        assert_eq!(backoff_for(base, max, 64), max);
    }

    #[tokio::test]
    async fn rate_limited_adds_count_until_forgotten() {
        let queue =
            WorkQueue::with_rate_limits("test-rate", Duration::from_millis(1), Duration::from_millis(10));
        let key = "ns/a".to_string();
        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);

        let item = timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("delayed item arrives")
            .expect("item");
        assert_eq!(item, key);
        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_drops_delayed_items() {
        let queue: WorkQueue<String> = WorkQueue::new("test-shutdown");
        queue.add_after("ns/late".to_string(), Duration::from_millis(50));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();

        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("join");
        assert!(result.is_none());
        queue.add("ns/ignored".to_string());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_items() {
        let queue = WorkQueue::new("test-drain");
        queue.add("ns/a".to_string());
        let item = queue.get().await.expect("item");

        let drained = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shut_down_with_drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drained.is_finished());

        queue.done(&item);
        timeout(Duration::from_secs(1), drained)
            .await
            .expect("drain completes")
            .expect("join");
    }
}
