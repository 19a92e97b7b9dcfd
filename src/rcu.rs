//! RCU Hash Map
//!
//! Read-copy-update hash index: readers are wait-free and lock-free, the
//! single owner inserts, removes and resizes, and displaced memory is
//! reclaimed only after an epoch grace period.
//!
//! # Design
//!
//! - One atomically published bucket-array pointer; buckets are singly
//!   linked node lists walked with acquire loads
//! - The owner rebuilds into a fresh array on resize and swaps the pointer;
//!   the old array (and its nodes) is destroyed after every reader that
//!   could observe it has unpinned
//! - Grow at `len >= 2 * buckets`, shrink when `2 * len + 1 < buckets`;
//!   capacity is a power of two, minimum 1
//! - Owner exclusivity is structural: mutation needs `&mut` on the owner
//!   handle, readers go through cheap cloneable [`RcuReadHandle`]s

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

pub use crossbeam_epoch::Guard;

/// Enter an epoch-protected read section.
#[inline]
pub fn pin() -> Guard {
    epoch::pin()
}

struct RcuNode<K, V> {
    key: K,
    value: V,
    next: Atomic<RcuNode<K, V>>,
}

struct BucketArray<K, V> {
    buckets: Box<[Atomic<RcuNode<K, V>>]>,
}

impl<K, V> BucketArray<K, V> {
    fn new(size: usize) -> Self {
        Self {
            buckets: (0..size).map(|_| Atomic::null()).collect(),
        }
    }
}

impl<K, V> Drop for BucketArray<K, V> {
    fn drop(&mut self) {
        // SAFETY: the array is past its grace period (or exclusively
        // owned), so no reader can still hold references into the chains.
        let guard = unsafe { epoch::unprotected() };
        for bucket in self.buckets.iter() {
            let mut cur = bucket.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                let next = unsafe { cur.deref() }.next.load(Ordering::Relaxed, guard);
                unsafe { drop(cur.into_owned()) };
                cur = next;
            }
        }
    }
}

struct Core<K, V, S> {
    buckets: Atomic<BucketArray<K, V>>,
    hash_builder: S,
    /// Element count; written by the owner only.
    len: AtomicUsize,
    /// Current bucket-array size; written by the owner only.
    bucket_count: AtomicUsize,
}

impl<K, V, S> Drop for Core<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: last reference; no guard can outlive the handles.
        let guard = unsafe { epoch::unprotected() };
        let shared = self.buckets.load(Ordering::Relaxed, guard);
        if !shared.is_null() {
            unsafe { drop(shared.into_owned()) };
        }
    }
}

impl<K, V, S> Core<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn find<'g>(&self, key: &K, guard: &'g Guard) -> Option<&'g V>
    where
        K: 'g,
    {
        let array = unsafe { self.buckets.load(Ordering::Acquire, guard).deref() };
        let mask = array.buckets.len() - 1;
        let hash = self.hash_builder.hash_one(key) as usize;

        let mut cur = array.buckets[hash & mask].load(Ordering::Acquire, guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.key == *key {
                return Some(&node.value);
            }
            cur = node.next.load(Ordering::Acquire, guard);
        }
        None
    }

    fn iter<'g>(&self, guard: &'g Guard) -> RcuIter<'g, K, V> {
        let array = unsafe { self.buckets.load(Ordering::Acquire, guard).deref() };
        RcuIter {
            array,
            bucket: 0,
            cur: Shared::null(),
            started: false,
            guard,
        }
    }
}

/// Single-owner RCU hash map.
///
/// The map itself is the owner handle: mutation requires `&mut self`, so
/// there is exactly one mutator by construction. Any number of
/// [`RcuReadHandle`]s may read concurrently from other threads.
pub struct RcuHashMap<K, V, S = RandomState> {
    core: Arc<Core<K, V, S>>,
}

/// Cheap cloneable read-side handle; `find` is wait-free.
pub struct RcuReadHandle<K, V, S = RandomState> {
    core: Arc<Core<K, V, S>>,
}

impl<K, V, S> Clone for RcuReadHandle<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<K, V, S> RcuHashMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Create a map with `initial_buckets` buckets (power of two, min 1)
    /// and the given hasher.
    pub fn with_hasher(initial_buckets: usize, hash_builder: S) -> Self {
        let size = initial_buckets.next_power_of_two().max(1);
        Self {
            core: Arc::new(Core {
                buckets: Atomic::new(BucketArray::new(size)),
                hash_builder,
                len: AtomicUsize::new(0),
                bucket_count: AtomicUsize::new(size),
            }),
        }
    }

    /// Obtain a read-side handle usable from any thread.
    pub fn read_handle(&self) -> RcuReadHandle<K, V, S> {
        RcuReadHandle {
            core: self.core.clone(),
        }
    }

    /// Look up `key` within the given read section.
    #[inline]
    pub fn find<'g>(&self, key: &K, guard: &'g Guard) -> Option<&'g V>
    where
        K: 'g,
    {
        self.core.find(key, guard)
    }

    /// Iterate all entries within the given read section.
    pub fn iter<'g>(&self, guard: &'g Guard) -> RcuIter<'g, K, V> {
        self.core.iter(guard)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.core.len.load(Ordering::Relaxed)
    }

    /// True when the map holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket-array size.
    pub fn bucket_count(&self) -> usize {
        self.core.bucket_count.load(Ordering::Relaxed)
    }

    /// Insert `key -> value`, replacing any existing entry for the key.
    /// Returns `true` when an entry was replaced.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let replaced = self.unlink(&key);
        if !replaced {
            self.core.len.fetch_add(1, Ordering::Relaxed);
        }
        self.maybe_grow();

        let guard = epoch::pin();
        let core = &*self.core;
        let array = unsafe { core.buckets.load(Ordering::Relaxed, &guard).deref() };
        let mask = array.buckets.len() - 1;
        let bucket = &array.buckets[core.hash_builder.hash_one(&key) as usize & mask];

        let node = Owned::new(RcuNode {
            key,
            value,
            next: Atomic::null(),
        });
        node.next
            .store(bucket.load(Ordering::Relaxed, &guard), Ordering::Relaxed);
        // The release store publishes the node, its key and its value.
        bucket.store(node, Ordering::Release);
        replaced
    }

    /// Remove `key` if present. Returns whether an entry was removed.
    pub fn remove(&mut self, key: &K) -> bool {
        if !self.unlink(key) {
            return false;
        }
        self.core.len.fetch_sub(1, Ordering::Relaxed);
        self.maybe_shrink();
        true
    }

    /// Unlink `key`'s node and defer its destruction. No resize, no count
    /// update.
    fn unlink(&mut self, key: &K) -> bool {
        let guard = epoch::pin();
        let core = &*self.core;
        let array = unsafe { core.buckets.load(Ordering::Relaxed, &guard).deref() };
        let mask = array.buckets.len() - 1;

        let mut link = &array.buckets[core.hash_builder.hash_one(key) as usize & mask];
        loop {
            let cur = link.load(Ordering::Relaxed, &guard);
            let node = match unsafe { cur.as_ref() } {
                Some(node) => node,
                None => return false,
            };
            if node.key == *key {
                // Readers mid-walk on the unlinked node still see a valid
                // suffix through its next pointer.
                let next = node.next.load(Ordering::Relaxed, &guard);
                link.store(next, Ordering::Release);
                // SAFETY: unreachable from the array once the store above
                // is published; destroyed after the grace period.
                unsafe { guard.defer_destroy(cur) };
                return true;
            }
            link = &node.next;
        }
    }

    fn maybe_grow(&mut self) {
        let len = self.core.len.load(Ordering::Relaxed);
        let buckets = self.core.bucket_count.load(Ordering::Relaxed);
        if len >= buckets * 2 {
            self.rebuild(buckets * 2);
        }
    }

    fn maybe_shrink(&mut self) {
        let len = self.core.len.load(Ordering::Relaxed);
        let buckets = self.core.bucket_count.load(Ordering::Relaxed);
        if 2 * len + 1 < buckets {
            self.rebuild((buckets / 2).max(1));
        }
    }

    /// Re-index every entry into a fresh bucket array and publish it; the
    /// old array and its nodes die after the grace period.
    fn rebuild(&mut self, new_size: usize) {
        debug_assert!(new_size.is_power_of_two() && new_size >= 1);

        let guard = epoch::pin();
        let core = &*self.core;
        let old_shared = core.buckets.load(Ordering::Relaxed, &guard);
        let old = unsafe { old_shared.deref() };

        let new_array = BucketArray::<K, V>::new(new_size);
        for bucket in old.buckets.iter() {
            let mut cur = bucket.load(Ordering::Relaxed, &guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                let slot =
                    &new_array.buckets[core.hash_builder.hash_one(&node.key) as usize & (new_size - 1)];
                let fresh = Owned::new(RcuNode {
                    key: node.key.clone(),
                    value: node.value.clone(),
                    next: Atomic::null(),
                });
                // Unpublished array: relaxed suffices until the swap below.
                fresh
                    .next
                    .store(slot.load(Ordering::Relaxed, &guard), Ordering::Relaxed);
                slot.store(fresh, Ordering::Relaxed);
                cur = node.next.load(Ordering::Relaxed, &guard);
            }
        }

        core.buckets.store(Owned::new(new_array), Ordering::Release);
        core.bucket_count.store(new_size, Ordering::Relaxed);
        // SAFETY: the old array is unreachable for new readers; existing
        // readers keep it alive through their pins.
        unsafe { guard.defer_destroy(old_shared) };
    }
}

impl<K, V, S> RcuHashMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Default,
{
    /// Create a map with `initial_buckets` buckets and a default hasher.
    pub fn new(initial_buckets: usize) -> Self {
        Self::with_hasher(initial_buckets, S::default())
    }
}

impl<K, V, S> RcuReadHandle<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Look up `key` within the given read section. Wait-free.
    #[inline]
    pub fn find<'g>(&self, key: &K, guard: &'g Guard) -> Option<&'g V>
    where
        K: 'g,
    {
        self.core.find(key, guard)
    }

    /// Iterate all entries within the given read section. The iterator
    /// remains valid against concurrent owner mutation for the lifetime of
    /// the guard; entries inserted or removed during iteration may or may
    /// not be observed.
    pub fn iter<'g>(&self, guard: &'g Guard) -> RcuIter<'g, K, V> {
        self.core.iter(guard)
    }
}

impl<K, V, S> fmt::Debug for RcuHashMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuHashMap")
            .field("len", &self.core.len.load(Ordering::Relaxed))
            .field("buckets", &self.core.bucket_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Read-side iterator over all entries; valid for its guard's lifetime.
pub struct RcuIter<'g, K, V> {
    array: &'g BucketArray<K, V>,
    bucket: usize,
    cur: Shared<'g, RcuNode<K, V>>,
    started: bool,
    guard: &'g Guard,
}

impl<'g, K, V> Iterator for RcuIter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.started {
                if self.bucket >= self.array.buckets.len() {
                    return None;
                }
                self.cur = self.array.buckets[self.bucket].load(Ordering::Acquire, self.guard);
                self.started = true;
            }
            match unsafe { self.cur.as_ref() } {
                Some(node) => {
                    self.cur = node.next.load(Ordering::Acquire, self.guard);
                    return Some((&node.key, &node.value));
                }
                None => {
                    self.bucket += 1;
                    self.started = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    type Map = RcuHashMap<u32, u64>;

    #[test]
    fn test_insert_find_remove() {
        let mut map: Map = RcuHashMap::new(1);
        let guard = pin();

        assert_eq!(map.find(&7, &guard), None);
        assert!(!map.insert(7, 70));
        assert_eq!(map.find(&7, &guard), Some(&70));
        assert_eq!(map.len(), 1);

        assert!(map.remove(&7));
        assert!(!map.remove(&7));
        assert_eq!(map.find(&7, &pin()), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_insert_overwrites() {
        let mut map: Map = RcuHashMap::new(4);
        assert!(!map.insert(1, 10));
        assert!(map.insert(1, 11));
        assert_eq!(map.len(), 1);
        assert_eq!(map.find(&1, &pin()), Some(&11));
    }

    #[test]
    fn test_grows_and_shrinks() {
        let mut map: Map = RcuHashMap::new(1);
        assert_eq!(map.bucket_count(), 1);

        for i in 0..64 {
            map.insert(i, u64::from(i));
        }
        assert!(map.bucket_count() >= 32, "expected growth past 64 entries");
        for i in 0..64 {
            assert_eq!(map.find(&i, &pin()), Some(&u64::from(i)));
        }

        for i in 0..64 {
            assert!(map.remove(&i));
        }
        assert_eq!(map.bucket_count(), 1);
    }

    #[test]
    fn test_iter_sees_all_entries() {
        let mut map: Map = RcuHashMap::new(2);
        for i in 0..100 {
            map.insert(i, u64::from(i) * 3);
        }
        let guard = pin();
        let mut seen: Vec<u32> = map.iter(&guard).map(|(k, _)| *k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_readers_during_resize() {
        const KEYS: u32 = 100_000;

        let mut map: Map = RcuHashMap::new(1);
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for t in 0..4u32 {
            let handle = map.read_handle();
            let stop = stop.clone();
            readers.push(thread::spawn(move || {
                let mut probe = t;
                while !stop.load(Ordering::Relaxed) {
                    let guard = pin();
                    probe = probe.wrapping_mul(2654435761).wrapping_add(t) % KEYS;
                    if let Some(v) = handle.find(&probe, &guard) {
                        // A hit is always the value written for that key.
                        assert_eq!(*v, u64::from(probe) * 2);
                    }
                }
            }));
        }

        for i in 0..KEYS {
            map.insert(i, u64::from(i) * 2);
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }

        assert_eq!(map.len(), KEYS as usize);
        assert!(map.bucket_count() >= (KEYS / 2) as usize);
        let guard = pin();
        for i in (0..KEYS).step_by(997) {
            assert_eq!(map.find(&i, &guard), Some(&(u64::from(i) * 2)));
        }
    }
}
