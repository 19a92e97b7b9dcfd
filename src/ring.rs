//! Lock-Free SPSC Rings
//!
//! Fixed-capacity single-producer/single-consumer queues for the frame
//! delivery hot path, plus the sleep-enabled variant used by flow and poll
//! rings.
//!
//! # Design
//!
//! - Two 32-bit monotonic counters, `begin` (consumer-written) and `end`
//!   (producer-written), on separate cache lines
//! - `size = end - begin` in wrapping arithmetic; `0 <= size <= N` holds for
//!   every observer
//! - The producer's release store of `end` publishes the slot; the
//!   consumer's release store of `begin` publishes the slot as reusable
//! - `Snapshot` captures the producer index so a third party can ask "was
//!   anything pushed since?" without touching the slots

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;

/// Opaque capture of a ring's producer index at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot(u32);

/// Fixed-capacity lock-free SPSC ring.
///
/// `N` must be a power of two. The raw `push`/`pop` operations are `unsafe`:
/// they are sound only while at most one thread pushes and at most one
/// thread pops. The safe endpoints in [`crate::flow`] and [`crate::poll`]
/// enforce that contract structurally.
pub struct RingSpsc<T, const N: usize> {
    begin: CachePadded<AtomicU32>,
    end: CachePadded<AtomicU32>,
    slots: [UnsafeCell<MaybeUninit<T>>; N],
}

// SAFETY: slot access is serialised by the single-producer/single-consumer
// contract on push/pop; the counters are atomic.
unsafe impl<T: Send, const N: usize> Send for RingSpsc<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for RingSpsc<T, N> {}

impl<T, const N: usize> RingSpsc<T, N> {
    /// Create an empty ring.
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        Self {
            begin: CachePadded::new(AtomicU32::new(0)),
            end: CachePadded::new(AtomicU32::new(0)),
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
        }
    }

    /// Push one element, failing when the ring is full.
    ///
    /// # Safety
    ///
    /// Caller must be the ring's only producer for the duration of the call.
    #[inline]
    pub unsafe fn push(&self, element: T) -> Result<(), T> {
        let end = self.end.load(Ordering::Relaxed); // producer-local
        let begin = self.begin.load(Ordering::Acquire);

        if end.wrapping_sub(begin) as usize >= N {
            return Err(element);
        }

        // SAFETY: the slot at `end` is outside the live window, and the
        // acquire load of `begin` ordered the consumer's last read of it
        // before this write.
        unsafe { (*self.slots[end as usize & (N - 1)].get()).write(element) };
        self.end.store(end.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop the oldest element, if any.
    ///
    /// # Safety
    ///
    /// Caller must be the ring's only consumer for the duration of the call.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        let begin = self.begin.load(Ordering::Relaxed); // consumer-local
        let end = self.end.load(Ordering::Acquire);

        if begin == end {
            return None;
        }

        // SAFETY: the acquire load of `end` ordered the producer's slot
        // write before this read; the release store below orders this read
        // before any producer reuse of the slot.
        let element = unsafe { (*self.slots[begin as usize & (N - 1)].get()).assume_init_read() };
        self.begin.store(begin.wrapping_add(1), Ordering::Release);
        Some(element)
    }

    /// Number of elements currently queued.
    ///
    /// Both loads are relaxed: the result is a sample, exact only for the
    /// thread that owns the corresponding counter. Callers that need the
    /// sample ordered against another access (the waiter protocol) pair it
    /// with an explicit fence.
    #[inline]
    pub fn size(&self) -> usize {
        let end = self.end.load(Ordering::Relaxed);
        let begin = self.begin.load(Ordering::Relaxed);
        end.wrapping_sub(begin) as usize
    }

    /// True when no elements are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Capacity of the ring.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Capture the current producer index.
    #[inline]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.end.load(Ordering::Relaxed))
    }

    /// Has anything been pushed since `snapshot` was taken?
    #[inline]
    pub fn modified_since(&self, snapshot: Snapshot) -> bool {
        snapshot.0 != self.end.load(Ordering::Relaxed)
    }
}

impl<T, const N: usize> Default for RingSpsc<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for RingSpsc<T, N> {
    fn drop(&mut self) {
        let end = *self.end.get_mut();
        let mut idx = *self.begin.get_mut();
        while idx != end {
            // SAFETY: exclusive access; slots in [begin, end) are initialised.
            unsafe { (*self.slots[idx as usize & (N - 1)].get()).assume_init_drop() };
            idx = idx.wrapping_add(1);
        }
    }
}

/// SPSC ring with a single parked-consumer slot.
///
/// The consumer parks with [`wait_for_items`](Self::wait_for_items); the
/// producer calls [`wake_consumer`](Self::wake_consumer) after every
/// successful push. The publish-handle → fence → recheck protocol on the
/// consumer side pairs with the push → fence → read-handle protocol on the
/// producer side, so a consumer that decides to sleep against an empty ring
/// cannot miss a concurrent push.
pub struct RingSpscWaiter<T, const N: usize> {
    ring: RingSpsc<T, N>,
    waiter: ArcSwapOption<Thread>,
}

impl<T, const N: usize> RingSpscWaiter<T, N> {
    /// Create an empty ring with no parked consumer.
    pub fn new() -> Self {
        Self {
            ring: RingSpsc::new(),
            waiter: ArcSwapOption::const_empty(),
        }
    }

    /// Push one element. See [`RingSpsc::push`].
    ///
    /// # Safety
    ///
    /// Caller must be the ring's only producer.
    #[inline]
    pub unsafe fn push(&self, element: T) -> Result<(), T> {
        unsafe { self.ring.push(element) }
    }

    /// Pop the oldest element. See [`RingSpsc::pop`].
    ///
    /// # Safety
    ///
    /// Caller must be the ring's only consumer.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        unsafe { self.ring.pop() }
    }

    /// Number of elements currently queued.
    #[inline]
    pub fn size(&self) -> usize {
        self.ring.size()
    }

    /// Capture the current producer index.
    #[inline]
    pub fn snapshot(&self) -> Snapshot {
        self.ring.snapshot()
    }

    /// Has anything been pushed since `snapshot` was taken?
    #[inline]
    pub fn modified_since(&self, snapshot: Snapshot) -> bool {
        self.ring.modified_since(snapshot)
    }

    /// Park the calling thread until the ring is nonempty.
    ///
    /// Consumer side only. Returns immediately when items are already
    /// queued. Tolerates spurious unparks by rechecking the size.
    pub fn wait_for_items(&self) {
        loop {
            if self.ring.size() > 0 {
                return;
            }

            // Publish our handle, then recheck. The SeqCst fence orders the
            // publication before the size sample; the producer's fence in
            // wake_consumer orders its push before the handle load. One of
            // the two threads must therefore see the other's write.
            self.waiter.store(Some(Arc::new(thread::current())));
            fence(Ordering::SeqCst);
            if self.ring.size() > 0 {
                self.waiter.store(None);
                return;
            }

            thread::park();
            self.waiter.store(None);
        }
    }

    /// Wake the parked consumer, if one is published.
    ///
    /// Producer side only; call after every successful push.
    #[inline]
    pub fn wake_consumer(&self) {
        fence(Ordering::SeqCst);
        if let Some(waiter) = self.waiter.load_full() {
            waiter.unpark();
        }
    }
}

impl<T, const N: usize> Default for RingSpscWaiter<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
