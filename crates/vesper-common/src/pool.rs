//! Bounded object pool
//!
//! A fixed-capacity MPMC queue of reusable objects plus a factory for cache
//! misses. Unlike an allocator-backed free list, items in the pool live for
//! as long as the pool does; unlike a semaphore, the pool never limits how
//! many objects exist at once: `get` always succeeds, falling back to the
//! factory, and `put` silently drops the item when the queue is full.
//!
//! Callers own an item from `get` until `put`, and must reset it before
//! handing it back.

use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capacity used for every runtime pool unless configured otherwise.
pub const DEFAULT_POOL_CAPACITY: usize = 2048;

/// Allocation and reuse counters for one logical pool.
///
/// Counters are shared through an `Arc` so that a pool rebuilt on every
/// reload keeps reporting into the same series.
#[derive(Debug, Default)]
pub struct PoolStats {
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    dropped: AtomicU64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    pub created: u64,
    pub reused: u64,
    pub returned: u64,
    pub dropped: u64,
}

/// Marker factory for pools whose items can only be built by the caller.
///
/// Use [`BoundedPool::get_with`] on such pools.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerBuilt;

/// Fixed-capacity concurrent object pool.
pub struct BoundedPool<T, F = CallerBuilt> {
    queue: ArrayQueue<T>,
    factory: F,
    stats: Arc<PoolStats>,
}

impl<T, F> fmt::Debug for BoundedPool<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

impl<T> BoundedPool<T, CallerBuilt> {
    /// Creates a pool whose items are constructed by the caller on a miss.
    ///
    /// This is the shape used for objects that can only be built with access
    /// to some thread-confined state, e.g. an interpreter.
    pub fn caller_built(capacity: usize) -> Self {
        Self::with_stats(capacity, CallerBuilt, Arc::new(PoolStats::new()))
    }
}

impl<T, F> BoundedPool<T, F>
where
    F: Fn() -> T,
{
    /// Creates a pool that builds items with `factory` on a miss.
    pub fn new(capacity: usize, factory: F) -> Self {
        Self::with_stats(capacity, factory, Arc::new(PoolStats::new()))
    }

    /// Takes a pooled item, or builds a fresh one with the factory.
    pub fn get(&self) -> T {
        self.get_with(&self.factory)
    }
}

impl<T, F> BoundedPool<T, F> {
    /// Creates a pool reporting into an existing set of counters.
    ///
    /// A capacity of zero is treated as one.
    pub fn with_stats(capacity: usize, factory: F, stats: Arc<PoolStats>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            factory,
            stats,
        }
    }

    /// Takes a pooled item without falling back to construction.
    pub fn try_get(&self) -> Option<T> {
        let item = self.queue.pop();
        if item.is_some() {
            self.stats.reused.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Takes a pooled item, or builds one with `make`.
    pub fn get_with(&self, make: impl FnOnce() -> T) -> T {
        match self.try_get() {
            Some(item) => item,
            None => {
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                make()
            }
        }
    }

    /// Returns an item to the pool.
    ///
    /// Returns `false` and drops the item if the pool is already full.
    pub fn put(&self, item: T) -> bool {
        match self.queue.push(item) {
            Ok(()) => {
                self.stats.returned.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_dropped) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Debug, Default, PartialEq)]
    struct Scratch {
        bytes: Vec<u8>,
        dirty: bool,
    }

    impl Scratch {
        fn reset(&mut self) {
            self.bytes.clear();
            self.dirty = false;
        }
    }

    #[test]
    fn test_get_falls_back_to_factory() {
        let built = AtomicUsize::new(0);
        let pool = BoundedPool::new(4, || {
            built.fetch_add(1, Ordering::SeqCst);
            Scratch::default()
        });

        let _a = pool.get();
        let _b = pool.get();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().snapshot().created, 2);
    }

    #[test]
    fn test_reset_item_matches_fresh_item() {
        let pool = BoundedPool::new(4, Scratch::default);

        let mut item = pool.get();
        item.bytes.extend_from_slice(b"request body");
        item.dirty = true;
        item.reset();
        assert!(pool.put(item));

        let reused = pool.get();
        assert_eq!(reused, Scratch::default());
        assert_eq!(pool.stats().snapshot().reused, 1);
    }

    #[test]
    fn test_put_drops_when_full() {
        let pool = BoundedPool::new(2, Scratch::default);
        assert!(pool.put(Scratch::default()));
        assert!(pool.put(Scratch::default()));
        assert!(!pool.put(Scratch::default()));
        assert_eq!(pool.len(), 2);

        let stats = pool.stats().snapshot();
        assert_eq!(stats.returned, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let pool = BoundedPool::new(0, || 1u32);
        assert_eq!(pool.capacity(), 1);
        assert!(pool.put(7));
        assert_eq!(pool.get(), 7);
    }

    #[test]
    fn test_caller_built_pool() {
        let pool: BoundedPool<String> = BoundedPool::caller_built(1);
        assert!(pool.try_get().is_none());

        let item = pool.get_with(|| "fresh".to_string());
        assert_eq!(item, "fresh");
        pool.put(item);
        assert_eq!(pool.get_with(|| unreachable!()), "fresh");
    }

    #[test]
    fn test_shared_stats_survive_rebuild() {
        let stats = Arc::new(PoolStats::new());
        let first = BoundedPool::with_stats(2, || 0u8, Arc::clone(&stats));
        first.get();
        drop(first);

        let second = BoundedPool::with_stats(2, || 0u8, Arc::clone(&stats));
        second.get();
        assert_eq!(stats.snapshot().created, 2);
    }

    #[test]
    fn test_concurrent_get_put() {
        let pool = Arc::new(BoundedPool::new(64, || 0u64));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    let mut item = pool.get();
                    item += i;
                    pool.put(0);
                    let _ = item;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.len() <= 64);
        let stats = pool.stats().snapshot();
        assert_eq!(stats.created + stats.reused, 8000);
        assert_eq!(stats.returned + stats.dropped, 8000);
    }
}
