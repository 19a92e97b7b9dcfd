//! Waitqueue With Wait-Morphing
//!
//! A condition-style FIFO of parked threads bound to a caller-supplied
//! mutex. Waking a thread that will immediately block on the mutex it was
//! waiting under is a wasted round trip; instead, `wake_one`/`wake_all`
//! transfer waiters directly onto the mutex's own park queue and the holder
//! hands the lock over at unlock. At most one woken thread is runnable at
//! any moment.
//!
//! # Design
//!
//! - [`Mutex`] is a two-bit word lock in the parking-lot style: a locked
//!   bit, a parked bit, and a per-address FIFO of sleeping threads
//! - Unlocking a contended mutex hands the lock to the oldest parked thread
//!   with a hand-off token rather than releasing it to be re-acquired
//! - [`WaitQueue`] has no queue storage of its own: its address keys a FIFO
//!   in the global parking lot, and wake-morphing is a requeue from the
//!   queue's address to the mutex's address
//! - The mutex is released only after the waiter is enqueued, so a wake
//!   between "decide to sleep" and "asleep" cannot be lost

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot_core::{
    self, ParkResult, RequeueOp, UnparkResult, UnparkToken, DEFAULT_PARK_TOKEN,
    DEFAULT_UNPARK_TOKEN,
};

const LOCKED_BIT: u8 = 0b01;
const PARKED_BIT: u8 = 0b10;

/// Unpark token meaning "the lock was handed to you; do not re-acquire".
const TOKEN_HANDOFF: UnparkToken = UnparkToken(1);

struct RawMutex {
    state: AtomicU8,
}

impl RawMutex {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    /// Parking-lot key for this lock.
    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & LOCKED_BIT != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state | LOCKED_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(s) => state = s,
            }
        }
    }

    #[inline]
    fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(0, LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);

            if state & LOCKED_BIT == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state | LOCKED_BIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            if state & PARKED_BIT == 0
                && self
                    .state
                    .compare_exchange_weak(
                        state,
                        state | PARKED_BIT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_err()
            {
                continue;
            }

            // SAFETY: addr is a valid key and the closures do not panic.
            let result = unsafe {
                parking_lot_core::park(
                    self.addr(),
                    || self.state.load(Ordering::Relaxed) == (LOCKED_BIT | PARKED_BIT),
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                )
            };
            if let ParkResult::Unparked(token) = result {
                if token == TOKEN_HANDOFF {
                    // The previous holder transferred the lock to us.
                    return;
                }
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        if self
            .state
            .compare_exchange(LOCKED_BIT, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.unlock_slow();
    }

    /// Hand the lock to the oldest parked thread, if any.
    #[cold]
    fn unlock_slow(&self) {
        // SAFETY: addr is a valid key; the callback runs under the bucket
        // lock, which also orders the hand-off for the woken thread.
        unsafe {
            parking_lot_core::unpark_one(self.addr(), |result: UnparkResult| {
                if result.unparked_threads != 0 {
                    // Keep LOCKED_BIT set: the woken thread owns the lock.
                    if !result.have_more_threads {
                        self.state.store(LOCKED_BIT, Ordering::Relaxed);
                    }
                    return TOKEN_HANDOFF;
                }
                // Stale parked bit (a waiter timed out); plain release.
                self.state.store(0, Ordering::Release);
                DEFAULT_UNPARK_TOKEN
            });
        }
    }

    /// Note that a thread was transferred onto this lock's park queue.
    #[inline]
    fn mark_parked(&self) {
        self.state.fetch_or(PARKED_BIT, Ordering::Relaxed);
    }
}

/// Mutual exclusion lock whose unlock path supports direct lock hand-off,
/// as required by [`WaitQueue`]'s wait-morphing wakes.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create a mutex protecting `data`.
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the mutex, returning the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, parking if contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire the lock only if it is immediately available.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard {
                mutex: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Mutable access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard for [`Mutex`]; the lock is released (or handed off) on drop.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> MutexGuard<'_, T> {
    #[inline]
    fn raw(&self) -> &RawMutex {
        &self.mutex.raw
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

/// FIFO of threads waiting on a condition, serialised by a caller-supplied
/// [`Mutex`].
///
/// All operations require the mutex held, which is what makes wait/wake
/// pairing race-free: a waiter is enqueued before the mutex is released, so
/// a wake posted by the next holder observes it.
pub struct WaitQueue {
    /// The mutex this queue is currently bound to; null when no thread is
    /// parked. Using one queue with two different mutexes is a caller bug.
    lock_ptr: AtomicPtr<RawMutex>,
}

impl WaitQueue {
    /// Create an empty waitqueue.
    pub const fn new() -> Self {
        Self {
            lock_ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Block until woken by [`wake_one`](Self::wake_one) or
    /// [`wake_all`](Self::wake_all).
    ///
    /// The mutex is released while parked and held again when `wait`
    /// returns. Callers must recheck their predicate: a wake certifies an
    /// event, not the predicate's current truth.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.wait_internal(guard, None);
    }

    /// As [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns `true` when the wait timed out. A timed-out waiter is
    /// removed from whichever park queue currently holds it; if a hand-off
    /// has already committed to the waiter it receives the lock instead and
    /// the wait did not time out.
    pub fn wait_for<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.wait_internal(guard, Some(timeout))
    }

    fn wait_internal<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> bool {
        let raw = guard.raw();
        let addr = self.addr();
        let lock_ptr = raw as *const RawMutex as *mut RawMutex;

        let validate = || {
            let bound = self.lock_ptr.load(Ordering::Relaxed);
            if bound.is_null() {
                self.lock_ptr.store(lock_ptr, Ordering::Relaxed);
            } else {
                debug_assert_eq!(bound, lock_ptr, "waitqueue bound to a different mutex");
            }
            true
        };
        // Release the mutex only after we are enqueued: a wake from the
        // next holder cannot slip between our decision to sleep and the
        // sleep itself.
        let before_sleep = || raw.unlock();
        let timed_out = |key: usize, was_last: bool| {
            // key != addr means we were already morphed onto the mutex
            // queue; the binding then refers to the remaining waiters.
            if key == addr && was_last {
                self.lock_ptr.store(ptr::null_mut(), Ordering::Relaxed);
            }
        };

        tracing::trace!(waitqueue = addr, "waitqueue wait");
        // SAFETY: addr keys this queue; the closures do not panic.
        let result = unsafe {
            parking_lot_core::park(
                addr,
                validate,
                before_sleep,
                timed_out,
                DEFAULT_PARK_TOKEN,
                timeout.map(|t| Instant::now() + t),
            )
        };

        match result {
            // Morphed wake: the lock was handed to us at the holder's
            // unlock; we already own it.
            ParkResult::Unparked(token) if token == TOKEN_HANDOFF => false,
            ParkResult::Unparked(_) => {
                raw.lock();
                false
            }
            ParkResult::TimedOut => {
                raw.lock();
                true
            }
            // validate never fails; the mutex was never released.
            ParkResult::Invalid => false,
        }
    }

    /// Transfer the oldest waiter onto the mutex's park queue.
    ///
    /// The waiter is woken by the holder's unlock, receiving the lock
    /// directly instead of contending for it.
    pub fn wake_one<T: ?Sized>(&self, guard: &MutexGuard<'_, T>) {
        tracing::trace!(waitqueue = self.addr(), "waitqueue wake_one");
        self.requeue(guard, RequeueOp::RequeueOne);
    }

    /// Transfer every waiter onto the mutex's park queue.
    ///
    /// The lock is handed to them one at a time as each holder releases;
    /// at most one of the woken threads is runnable at any moment.
    pub fn wake_all<T: ?Sized>(&self, guard: &MutexGuard<'_, T>) {
        tracing::trace!(waitqueue = self.addr(), "waitqueue wake_all");
        self.requeue(guard, RequeueOp::RequeueAll);
    }

    fn requeue<T: ?Sized>(&self, guard: &MutexGuard<'_, T>, op: RequeueOp) {
        let raw = guard.raw();
        let lock_ptr = raw as *const RawMutex as *mut RawMutex;

        let validate = || {
            let bound = self.lock_ptr.load(Ordering::Relaxed);
            if bound.is_null() {
                return RequeueOp::Abort;
            }
            debug_assert_eq!(bound, lock_ptr, "waitqueue bound to a different mutex");
            op
        };
        let callback = |_op: RequeueOp, result: UnparkResult| {
            if !result.have_more_threads {
                self.lock_ptr.store(ptr::null_mut(), Ordering::Relaxed);
            }
            if result.requeued_threads != 0 {
                raw.mark_parked();
            }
            DEFAULT_UNPARK_TOKEN
        };
        // SAFETY: both keys are valid; the closures do not panic.
        unsafe {
            parking_lot_core::unpark_requeue(self.addr(), raw.addr(), validate, callback);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutex_mutual_exclusion() {
        let mutex = Arc::new(Mutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mutex = mutex.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *mutex.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 40_000);
    }

    #[test]
    fn test_try_lock() {
        let mutex = Mutex::new(1);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_wait_wake_one() {
        struct State {
            ready: bool,
        }
        let mutex = Arc::new(Mutex::new(State { ready: false }));
        let wq = Arc::new(WaitQueue::new());

        let waiter = {
            let mutex = mutex.clone();
            let wq = wq.clone();
            thread::spawn(move || {
                let mut guard = mutex.lock();
                while !guard.ready {
                    wq.wait(&mut guard);
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        {
            let mut guard = mutex.lock();
            guard.ready = true;
            wq.wake_one(&guard);
        }
        waiter.join().unwrap();
    }

    #[test]
    fn test_wake_without_waiters_is_noop() {
        let mutex = Mutex::new(());
        let wq = WaitQueue::new();
        let guard = mutex.lock();
        wq.wake_one(&guard);
        wq.wake_all(&guard);
    }

    #[test]
    fn test_wait_for_times_out() {
        let mutex = Mutex::new(());
        let wq = WaitQueue::new();
        let mut guard = mutex.lock();
        let start = Instant::now();
        let timed_out = wq.wait_for(&mut guard, Duration::from_millis(50));
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(50));
        // The lock is held again after the timeout.
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_fifo_wake_order() {
        const WAITERS: usize = 8;
        struct State {
            armed: usize,
            wake_order: Vec<usize>,
        }
        let mutex = Arc::new(Mutex::new(State {
            armed: 0,
            wake_order: Vec::new(),
        }));
        let wq = Arc::new(WaitQueue::new());

        let mut handles = Vec::new();
        for i in 0..WAITERS {
            // Arm waiters strictly one at a time so the park order is the
            // spawn order.
            loop {
                if mutex.lock().armed == i {
                    break;
                }
                thread::yield_now();
            }
            let mutex_clone = mutex.clone();
            let wq = wq.clone();
            handles.push(thread::spawn(move || {
                let mut guard = mutex_clone.lock();
                guard.armed += 1;
                wq.wait(&mut guard);
                guard.wake_order.push(i);
            }));
            // A waiter is enqueued before its unlock is visible, so once we
            // observe armed == i + 1 it is parked in FIFO position i.
            loop {
                if mutex.lock().armed == i + 1 {
                    break;
                }
                thread::yield_now();
            }
        }

        {
            let guard = mutex.lock();
            for _ in 0..WAITERS {
                wq.wake_one(&guard);
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        let state = mutex.lock();
        assert_eq!(state.wake_order, (0..WAITERS).collect::<Vec<_>>());
    }

    #[test]
    fn test_wake_all_hands_off_one_at_a_time() {
        const WAITERS: usize = 8;
        let mutex = Arc::new(Mutex::new(0usize));
        let wq = Arc::new(WaitQueue::new());
        let in_critical = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..WAITERS {
            let mutex = mutex.clone();
            let wq = wq.clone();
            let in_critical = in_critical.clone();
            handles.push(thread::spawn(move || {
                let mut guard = mutex.lock();
                *guard += 1;
                wq.wait(&mut guard);
                // The lock was handed to us; no other woken thread may be
                // inside its critical section concurrently.
                assert!(!in_critical.swap(true, Ordering::SeqCst));
                thread::sleep(Duration::from_millis(1));
                in_critical.store(false, Ordering::SeqCst);
            }));
        }

        loop {
            if *mutex.lock() == WAITERS {
                break;
            }
            thread::yield_now();
        }
        {
            let guard = mutex.lock();
            wq.wake_all(&guard);
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
