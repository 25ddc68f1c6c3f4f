//! Bounded task queues and in-flight key sets shared by the engines

use super::Shutdown;

use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Keys with work in flight, capped at `capacity`
pub struct BoundedKeySet {
    name: &'static str,
    capacity: usize,
    keys: Mutex<HashSet<String>>,
}

impl BoundedKeySet {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            keys: Mutex::new(HashSet::new()),
        }
    }

    /// Insert unless present or full
    pub fn try_insert(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if keys.contains(key) {
            return false;
        }
        if keys.len() >= self.capacity {
            warn!("{} set is full ({}), rejecting {}", self.name, self.capacity, key);
            return false;
        }
        keys.insert(key.to_string());
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn remove(&self, key: &str) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Claim a key for the lifetime of the returned guard
    pub fn acquire(self: &Arc<Self>, key: &str) -> Option<KeyGuard> {
        if self.try_insert(key) {
            Some(KeyGuard {
                set: self.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

/// Releases its key from the set on drop
pub struct KeyGuard {
    set: Arc<BoundedKeySet>,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

/// Result of offering a task to a `TaskQueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    AlreadyQueued,
    Full,
    NoChannel,
}

/// Per-chain FIFO channels; a key sits in the queue at most once
pub struct TaskQueue<T> {
    name: &'static str,
    capacity: usize,
    senders: DashMap<u64, mpsc::Sender<(String, T)>>,
    queued: DashSet<String>,
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            senders: DashMap::new(),
            queued: DashSet::new(),
        }
    }

    /// Open the channel of a chain and return its consumer end
    pub fn register(&self, chain_id: u64) -> mpsc::Receiver<(String, T)> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.insert(chain_id, tx);
        rx
    }

    /// Offer a task without blocking; a full channel drops it
    pub fn push(&self, chain_id: u64, key: String, task: T) -> PushOutcome {
        let Some(sender) = self.senders.get(&chain_id).map(|s| s.clone()) else {
            return PushOutcome::NoChannel;
        };
        if !self.queued.insert(key.clone()) {
            return PushOutcome::AlreadyQueued;
        }
        match sender.try_send((key.clone(), task)) {
            Ok(()) => {
                debug!("Queued {} task {} for chain {}", self.name, key, chain_id);
                PushOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.queued.remove(&key);
                warn!(
                    "{} queue of chain {} is full, dropped {}",
                    self.name, chain_id, key
                );
                crate::metrics::record_queue_drop(self.name, chain_id);
                PushOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queued.remove(&key);
                PushOutcome::NoChannel
            }
        }
    }

    /// Mark a task processed so its key can be queued again
    pub fn done(&self, key: &str) {
        self.queued.remove(key);
    }

    pub fn is_queued(&self, key: &str) -> bool {
        self.queued.contains(key)
    }
}

/// Drain one chain's channel in order until shutdown
pub async fn consume<T, F, Fut>(
    mut rx: mpsc::Receiver<(String, T)>,
    queue: Arc<TaskQueue<T>>,
    shutdown: Shutdown,
    mut handle: F,
) where
    T: Send + 'static,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            task = rx.recv() => {
                let Some((key, task)) = task else { break };
                handle(task).await;
                queue.done(&key);
                if shutdown.is_triggered() {
                    break;
                }
            }
            _ = shutdown.wait() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_key_set() {
        let set = Arc::new(BoundedKeySet::new("test", 2));
        assert!(set.try_insert("a"));
        assert!(!set.try_insert("a"));
        assert!(set.try_insert("b"));
        assert!(!set.try_insert("c"));
        set.remove("a");
        {
            let guard = set.acquire("c");
            assert!(guard.is_some());
            assert!(set.acquire("c").is_none());
        }
        assert!(!set.contains("c"));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_task_queue_fifo_and_no_double_enqueue() {
        let queue: TaskQueue<u32> = TaskQueue::new("test", 4);
        let mut rx = queue.register(56);

        assert_eq!(queue.push(56, "k1".into(), 1), PushOutcome::Queued);
        assert_eq!(queue.push(56, "k1".into(), 1), PushOutcome::AlreadyQueued);
        assert_eq!(queue.push(56, "k2".into(), 2), PushOutcome::Queued);
        assert_eq!(queue.push(1, "k3".into(), 3), PushOutcome::NoChannel);

        assert_eq!(rx.recv().await, Some(("k1".to_string(), 1)));
        assert_eq!(rx.recv().await, Some(("k2".to_string(), 2)));

        assert!(queue.is_queued("k1"));
        queue.done("k1");
        assert_eq!(queue.push(56, "k1".into(), 1), PushOutcome::Queued);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let queue: TaskQueue<u32> = TaskQueue::new("test", 1);
        let _rx = queue.register(56);
        assert_eq!(queue.push(56, "k1".into(), 1), PushOutcome::Queued);
        assert_eq!(queue.push(56, "k2".into(), 2), PushOutcome::Full);
        assert!(!queue.is_queued("k2"));
    }

    #[tokio::test]
    async fn test_consume_stops_on_shutdown() {
        let queue = Arc::new(TaskQueue::new("test", 4));
        let rx = queue.register(56);
        let shutdown = Shutdown::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        queue.push(56, "k1".into(), 1u32);
        queue.push(56, "k2".into(), 2u32);

        let handle = tokio::spawn({
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            let seen = seen.clone();
            async move {
                consume(rx, queue, shutdown, |task| {
                    let seen = seen.clone();
                    async move { seen.lock().unwrap().push(task) }
                })
                .await
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.trigger();
        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(!queue.is_queued("k1"));
    }
}
