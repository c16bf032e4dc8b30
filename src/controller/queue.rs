//! Work queue of Modules waiting for reconciliation
//!
//! A key is queued at most once. A key handed to a worker stays exclusive to
//! it until [`WorkQueue::done`]; adds that arrive meanwhile mark it dirty and
//! it is queued again when the worker finishes.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::crd::ModuleKey;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ModuleKey>,
    queued: HashSet<ModuleKey>,
    active: HashSet<ModuleKey>,
    dirty: HashSet<ModuleKey>,
    shutdown: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: ModuleKey) {
        let mut state = self.state();
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: ModuleKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn next(&self) -> Option<ModuleKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by [`WorkQueue::next`]
    pub fn done(&self, key: &ModuleKey) {
        let mut state = self.state();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.state().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ModuleKey {
        ModuleKey::new("apps", name)
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
    }

    #[tokio::test]
    async fn test_active_key_is_deferred_until_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let first = queue.next().await.unwrap();

        queue.add(key("a"));
        assert!(queue.is_empty());

        queue.done(&first);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays() {
        let queue = WorkQueue::new();
        queue.add_after(key("a"), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }
}
