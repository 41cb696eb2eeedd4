//! Keyed work queue feeding the reconcile workers.
//!
//! Guarantees:
//! - a key is queued at most once at a time (adds are de-duplicated);
//! - a key is handed to at most one worker at a time; an add that arrives
//!   while the key is in flight marks it dirty and it is queued again when
//!   the worker calls [`WorkQueue::done`];
//! - delayed adds keep only the earliest pending deadline per key;
//! - per-key failure counts drive an exponential backoff delay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay after `failures` consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    in_flight: HashSet<K>,
    dirty: HashSet<K>,
    delayed: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    fn enqueue(&mut self, key: K) -> bool {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
            return true;
        }
        false
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<K> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            self.delayed.remove(&key);
            self.enqueue(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: Backoff,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                dirty: HashSet::new(),
                delayed: HashMap::new(),
                failures: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // The state is plain data with no invariants spanning a panic point.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `key` for immediate processing.
    pub fn add(&self, key: K) {
        let woke = {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            state.enqueue(key)
        };
        if woke {
            self.notify.notify_waiters();
        }
    }

    /// Queues `key` once `delay` has elapsed. An earlier pending deadline for
    /// the same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            let slot = state.delayed.entry(key).or_insert(at);
            if at < *slot {
                *slot = at;
            }
        }
        // Sleeping workers re-compute their wake-up deadline.
        self.notify.notify_waiters();
    }

    /// Records a failure for `key` and queues it after the backoff delay.
    /// Returns the delay used.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            self.backoff.delay(*failures)
        };
        self.add_after(key, delay);
        delay
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key to process. Returns `None` after shutdown.
    /// The caller must hand the key back through [`WorkQueue::done`].
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
                state.next_deadline()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks the pass for `key` finished; re-queues it if it was added while
    /// in flight.
    pub fn done(&self, key: &K) {
        let woke = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            if state.dirty.remove(key) && !state.shutdown {
                state.enqueue(key.clone())
            } else {
                false
            }
        };
        if woke {
            self.notify.notify_waiters();
        }
    }

    /// Stops handing out keys; pending `next` calls return `None`.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Keys queued for immediate processing.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting on a delay.
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_adds_are_deduplicated() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
    }

    #[tokio::test]
    async fn test_in_flight_key_is_redelivered_after_done() {
        let q = queue();
        q.add("a");
        let key = q.next().await.unwrap();

        q.add("a");
        assert!(q.is_empty(), "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_deadline() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(60));
        assert!(q.is_empty());
        assert_eq!(q.delayed_len(), 1);

        assert_eq!(q.next().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_deadline_wins() {
        let q = queue();
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(60));
        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_secs(30));
        assert_eq!(q.delayed_len(), 1);

        assert_eq!(q.next().await, Some("a"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_and_forget() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(100));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(200));
        assert_eq!(q.failures(&"a"), 2);

        q.forget(&"a");
        assert_eq!(q.failures(&"a"), 0);
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = std::sync::Arc::new(queue());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("a");
        assert!(q.is_empty());
    }
}
