//! Keyed registry of pending futures
//!
//! [`PromiseManager`] gives insert-if-absent-else-join semantics: every call
//! for a key that arrives before the first one settles shares one producer
//! run and observes the same settled value. The entry is dropped on
//! settlement so a later call starts fresh.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cloneable handle on a pending result
pub type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Pending<T, E> {
    generation: u64,
    future: SharedResult<T, E>,
}

type PendingMap<K, T, E> = Arc<Mutex<HashMap<K, Pending<T, E>>>>;

/// Registry of in-flight producers keyed by `K`
///
/// Producers are invoked while the registry lock is held, so they must only
/// build their future and never call back into the same manager
/// synchronously.
pub struct PromiseManager<K, T, E> {
    pending: PendingMap<K, T, E>,
    next_generation: AtomicU64,
}

impl<K, T, E> PromiseManager<K, T, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Join the pending future for `key`, or start one with `producer`
    pub fn execute<F, Fut>(&self, key: K, producer: F) -> SharedResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(&key) {
            tracing::trace!("joining pending producer");
            return existing.future.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let future = self.settle_with_cleanup(vec![key.clone()], generation, producer());
        pending.insert(
            key,
            Pending {
                generation,
                future: future.clone(),
            },
        );
        future
    }

    /// Batch form of [`execute`](Self::execute)
    ///
    /// Keys already pending are joined; the remaining keys are handed to a
    /// single `producer` run registered under each of them. Returns the
    /// distinct futures covering every key.
    pub fn execute_batch<F, Fut>(&self, keys: &[K], producer: F) -> Vec<SharedResult<T, E>>
    where
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        let mut joined: Vec<(u64, SharedResult<T, E>)> = Vec::new();
        let mut missing: Vec<K> = Vec::new();

        for key in keys {
            match pending.get(key) {
                Some(existing) => {
                    if !joined.iter().any(|(g, _)| *g == existing.generation) {
                        joined.push((existing.generation, existing.future.clone()));
                    }
                }
                None => {
                    if !missing.contains(key) {
                        missing.push(key.clone());
                    }
                }
            }
        }

        if !missing.is_empty() {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let future =
                self.settle_with_cleanup(missing.clone(), generation, producer(missing.clone()));
            for key in missing {
                pending.insert(
                    key,
                    Pending {
                        generation,
                        future: future.clone(),
                    },
                );
            }
            joined.push((generation, future));
        }

        joined.into_iter().map(|(_, f)| f).collect()
    }

    /// Check if `key` has a pending producer
    #[inline]
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Number of keys with a pending producer
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Forget every pending entry
    ///
    /// Callers already holding a future keep it; new calls start fresh.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    fn settle_with_cleanup<Fut>(
        &self,
        keys: Vec<K>,
        generation: u64,
        fut: Fut,
    ) -> SharedResult<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let registry = Arc::clone(&self.pending);
        async move {
            let result = fut.await;
            let mut pending = registry.lock();
            for key in &keys {
                if pending.get(key).is_some_and(|p| p.generation == generation) {
                    pending.remove(key);
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}

impl<K, T, E> Default for PromiseManager<K, T, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T, E> std::fmt::Debug for PromiseManager<K, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseManager")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
