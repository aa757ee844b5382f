//! Reference-counted resource handles backed by recycling pools.
//!
//! A [`SharedPool`] hands out [`Shared<T>`] handles over resources that are
//! expensive to allocate (large buffers, decoded frames). Cloning a handle
//! increments the reference count; releasing the final handle returns the
//! resource to the pool instead of dropping it, so steady-state operation
//! allocates nothing.
//!
//! # Examples
//!
//! ```
//! use tempo_pool::SharedPool;
//!
//! let pool = SharedPool::<Vec<u8>>::new(8);
//! {
//!     let buffer = pool.get_or_create(|| vec![0u8; 1024]);
//!     let alias = buffer.clone();
//!     assert_eq!(alias.len(), 1024);
//! }
//! // Both handles released: the vector is back in the pool.
//! assert_eq!(pool.available(), 1);
//! assert_eq!(pool.total_allocated(), 1);
//!
//! let again = pool.get_or_create(|| vec![0u8; 1024]);
//! assert_eq!(pool.total_allocated(), 1);
//! drop(again);
//! ```
#![forbid(missing_docs)]

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A pool of recyclable resources of a single shape.
///
/// The pool tracks every resource it ever allocated and retains up to
/// `max_retained` released resources for reuse. Resources released beyond
/// the retention cap are dropped.
pub struct SharedPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    available: Mutex<Vec<T>>,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
    max_retained: usize,
}

impl<T: Send + 'static> SharedPool<T> {
    /// Creates a pool retaining at most `max_retained` released resources.
    pub fn new(max_retained: usize) -> Self {
        SharedPool {
            inner: Arc::new(PoolInner {
                available: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                recycled: AtomicUsize::new(0),
                max_retained,
            }),
        }
    }

    /// Returns a pooled resource, or allocates one with `factory`.
    pub fn get_or_create(&self, factory: impl FnOnce() -> T) -> Shared<T> {
        let recycled = self.inner.available.lock().expect("pool poisoned").pop();
        let resource = match recycled {
            Some(resource) => resource,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                factory()
            }
        };
        Shared::with_pool(resource, &self.inner)
    }

    /// Returns a pooled resource if one is available, without allocating.
    pub fn try_get(&self) -> Option<Shared<T>> {
        let resource = self.inner.available.lock().expect("pool poisoned").pop()?;
        Some(Shared::with_pool(resource, &self.inner))
    }

    /// Number of released resources currently held for reuse.
    pub fn available(&self) -> usize {
        self.inner.available.lock().expect("pool poisoned").len()
    }

    /// Number of resources ever allocated by this pool.
    pub fn total_allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Number of resources returned to the pool over its lifetime.
    pub fn total_recycled(&self) -> usize {
        self.inner.recycled.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Clone for SharedPool<T> {
    fn clone(&self) -> Self {
        SharedPool { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> fmt::Debug for SharedPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("available", &self.available())
            .field("allocated", &self.total_allocated())
            .field("max_retained", &self.inner.max_retained)
            .finish()
    }
}

impl<T> PoolInner<T> {
    /// Accepts a resource released by the last outstanding handle.
    fn recycle(&self, resource: T) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
        let mut available = self.available.lock().expect("pool poisoned");
        if available.len() < self.max_retained {
            available.push(resource);
        }
        // Beyond the retention cap the resource drops here.
    }
}

/// The recyclable payload of one or more `Shared` handles.
///
/// Dropping the last `Arc` over this slot sends the resource back to its
/// pool, if the pool is still alive.
struct Slot<T> {
    resource: Option<T>,
    pool: Weak<PoolInner<T>>,
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.recycle(resource);
            }
        }
    }
}

/// A reference-counted handle over a pooled resource.
///
/// Cloning adds a reference; [`Shared::release`] (or drop) removes one.
/// When the final reference goes away the resource returns to its pool
/// exactly once. A handle that has been explicitly released reads its
/// resource as absent.
pub struct Shared<T: Send + 'static> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T: Send + 'static> Shared<T> {
    /// Wraps a resource without a backing pool; the final release drops it.
    pub fn from_value(resource: T) -> Self {
        Shared {
            slot: Some(Arc::new(Slot { resource: Some(resource), pool: Weak::new() })),
        }
    }

    fn with_pool(resource: T, pool: &Arc<PoolInner<T>>) -> Self {
        Shared {
            slot: Some(Arc::new(Slot {
                resource: Some(resource),
                pool: Arc::downgrade(pool),
            })),
        }
    }

    /// The underlying resource, or `None` if this handle was released.
    pub fn resource(&self) -> Option<&T> {
        self.slot.as_ref().and_then(|slot| slot.resource.as_ref())
    }

    /// Mutable access to the resource, available only while this handle is
    /// the sole outstanding reference. Used by deserializers to overwrite a
    /// pooled target in place.
    pub fn try_resource_mut(&mut self) -> Option<&mut T> {
        let slot = self.slot.as_mut()?;
        Arc::get_mut(slot).and_then(|slot| slot.resource.as_mut())
    }

    /// Drops this handle's reference. The resource is recycled when the
    /// last reference is released; afterwards [`Shared::resource`] on this
    /// handle reads `None`. Releasing twice is a no-op.
    pub fn release(&mut self) {
        self.slot = None;
    }

    /// True if this handle still references the resource.
    pub fn is_live(&self) -> bool {
        self.slot.is_some()
    }

    /// Number of handles currently referencing the resource, zero if this
    /// handle was released.
    pub fn reference_count(&self) -> usize {
        self.slot.as_ref().map_or(0, Arc::strong_count)
    }
}

impl<T: Send + 'static> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared { slot: self.slot.clone() }
    }
}

impl<T: Send + 'static> Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.resource().expect("Shared handle used after release")
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource() {
            Some(resource) => f.debug_tuple("Shared").field(resource).finish(),
            None => f.write_str("Shared(released)"),
        }
    }
}

/// Pools partitioned by key, so requests of different shapes (for example
/// buffer sizes) recycle independently.
pub struct KeyedSharedPool<K: Eq + Hash + Clone, T: Send + 'static> {
    pools: Mutex<HashMap<K, SharedPool<T>>>,
    max_retained_each: usize,
}

impl<K: Eq + Hash + Clone, T: Send + 'static> KeyedSharedPool<K, T> {
    /// Creates a keyed pool; each per-key pool retains at most
    /// `max_retained_each` released resources.
    pub fn new(max_retained_each: usize) -> Self {
        KeyedSharedPool {
            pools: Mutex::new(HashMap::new()),
            max_retained_each,
        }
    }

    /// Returns a resource recycled under `key`, or allocates one.
    pub fn get_or_create(&self, key: K, factory: impl FnOnce() -> T) -> Shared<T> {
        self.pool_for(key).get_or_create(factory)
    }

    /// The dedicated pool for `key`, created on first use.
    pub fn pool_for(&self, key: K) -> SharedPool<T> {
        let mut pools = self.pools.lock().expect("pool poisoned");
        pools
            .entry(key)
            .or_insert_with(|| SharedPool::new(self.max_retained_each))
            .clone()
    }

    /// Number of distinct keys with a live pool.
    pub fn key_count(&self) -> usize {
        self.pools.lock().expect("pool poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_on_final_release() {
        let pool = SharedPool::<Vec<u8>>::new(4);
        let mut first = pool.get_or_create(|| vec![1u8, 2, 3]);
        let second = first.clone();
        let third = first.clone();

        first.release();
        assert!(first.resource().is_none());
        assert_eq!(pool.available(), 0);

        drop(second);
        assert_eq!(pool.available(), 0);
        drop(third);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total_recycled(), 1);
        assert_eq!(pool.total_allocated(), 1);
    }

    #[test]
    fn n_addrefs_n_plus_one_disposes_recycle_once() {
        let pool = SharedPool::<String>::new(4);
        let mut handles = vec![pool.get_or_create(|| String::from("x"))];
        for _ in 0..5 {
            let clone = handles[0].clone();
            handles.push(clone);
        }
        for handle in &mut handles {
            handle.release();
        }
        assert_eq!(pool.total_recycled(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn reuses_pooled_storage() {
        let pool = SharedPool::<Vec<u8>>::new(4);
        drop(pool.get_or_create(|| Vec::with_capacity(64)));
        let reused = pool.get_or_create(|| Vec::with_capacity(16));
        assert_eq!(pool.total_allocated(), 1);
        assert!(reused.capacity() >= 64);
    }

    #[test]
    fn retention_cap_drops_excess() {
        let pool = SharedPool::<Vec<u8>>::new(1);
        let a = pool.get_or_create(Vec::new);
        let b = pool.get_or_create(Vec::new);
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total_allocated(), 2);
    }

    #[test]
    fn exclusive_mutation_requires_unique_handle() {
        let pool = SharedPool::<Vec<u8>>::new(4);
        let mut unique = pool.get_or_create(Vec::new);
        assert!(unique.try_resource_mut().is_some());
        let alias = unique.clone();
        assert!(unique.try_resource_mut().is_none());
        drop(alias);
        unique.try_resource_mut().expect("unique again").push(7);
        assert_eq!(&*unique, &[7u8]);
    }

    #[test]
    fn keyed_pools_are_disjoint() {
        let pools = KeyedSharedPool::<usize, Vec<u8>>::new(4);
        drop(pools.get_or_create(1024, || vec![0u8; 1024]));
        drop(pools.get_or_create(64, || vec![0u8; 64]));
        assert_eq!(pools.key_count(), 2);
        let large = pools.get_or_create(1024, || vec![0u8; 1024]);
        assert_eq!(large.len(), 1024);
        assert_eq!(pools.pool_for(1024).total_allocated(), 1);
        assert_eq!(pools.pool_for(64).total_allocated(), 1);
    }

    #[test]
    fn unpooled_value_drops_quietly() {
        let mut shared = Shared::from_value(String::from("transient"));
        assert_eq!(shared.reference_count(), 1);
        shared.release();
        assert_eq!(shared.reference_count(), 0);
        assert!(shared.resource().is_none());
    }
}
