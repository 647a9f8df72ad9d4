//! # In-Flight Task Registry
//!
//! De-duplicates background work by key: a sync cycle, an asset download,
//! a unit prefetch.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  run_or_join("a1", download)                                           │
//! │       │                                                                 │
//! │       ├── key absent   → tokio::spawn(download), store Shared handle   │
//! │       │                  (the task removes its key when it finishes)   │
//! │       │                                                                 │
//! │       └── key present  → clone the stored Shared handle                │
//! │                                                                         │
//! │  Every caller awaits the same result. Dropping a handle only stops     │
//! │  that caller listening; the spawned work runs to completion.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::CacheError;

/// A result many callers can await.
pub type SharedTask<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

/// Keyed registry of running tasks.
pub struct TaskRegistry<K, V> {
    name: &'static str,
    running: Arc<Mutex<HashMap<K, SharedTask<V>>>>,
}

impl<K, V> Clone for TaskRegistry<K, V> {
    fn clone(&self) -> Self {
        TaskRegistry {
            name: self.name,
            running: Arc::clone(&self.running),
        }
    }
}

impl<K, V> TaskRegistry<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry; `name` labels log lines.
    pub fn new(name: &'static str) -> Self {
        TaskRegistry {
            name,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, SharedTask<V>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attaches to the task running under `key`, or spawns `make()` for it.
    ///
    /// ## Returns
    /// The shared result and `true` if an existing task was joined.
    pub fn run_or_join<F, Fut>(&self, key: K, make: F) -> (SharedTask<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
    {
        let mut running = self.lock();

        if let Some(existing) = running.get(&key) {
            debug!(registry = self.name, ?key, "Joining in-flight task");
            return (existing.clone(), true);
        }

        let work = make();
        let registry = Arc::clone(&self.running);
        let done_key = key.clone();

        let handle = tokio::spawn(async move {
            let result = work.await;
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&done_key);
            result
        });

        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(CacheError::from(join_error)),
            }
        }
        .boxed()
        .shared();

        debug!(registry = self.name, ?key, "Started task");
        running.insert(key, shared.clone());

        (shared, false)
    }

    /// True while a task for `key` is running.
    pub fn is_running(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of running tasks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_second_caller_joins_first() {
        let registry: TaskRegistry<String, usize> = TaskRegistry::new("test");
        let starts = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let counter = Arc::clone(&starts);
        let (first, joined) = registry.run_or_join("k".to_string(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok(7)
        });
        assert!(!joined);

        let counter = Arc::clone(&starts);
        let (second, joined) = registry.run_or_join("k".to_string(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        });
        assert!(joined);
        assert!(registry.is_running(&"k".to_string()));

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_released_after_completion() {
        let registry: TaskRegistry<u8, u8> = TaskRegistry::new("test");

        let (task, _) = registry.run_or_join(1, || async { Ok(1) });
        assert_eq!(task.await.unwrap(), 1);
        tokio::task::yield_now().await;
        assert!(registry.is_empty());

        let (task, joined) = registry.run_or_join(1, || async { Ok(2) });
        assert!(!joined);
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_abort_work() {
        let registry: TaskRegistry<u8, ()> = TaskRegistry::new("test");
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let (task, _) = registry.run_or_join(1, move || async move {
            tokio::task::yield_now().await;
            let _ = done_tx.send(());
            Ok(())
        });
        drop(task);

        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let registry: TaskRegistry<u8, ()> = TaskRegistry::new("test");
        let (task, _) =
            registry.run_or_join(1, || async { Err(CacheError::network("offline")) });
        let err = task.clone().await.unwrap_err();
        assert_eq!(err, CacheError::network("offline"));
        assert_eq!(task.await.unwrap_err().message, "offline");
    }
}
