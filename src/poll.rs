//! Poll Rings
//!
//! The mechanism by which one consumer thread sleeps on many flow rings: a
//! waiter-enabled SPSC ring of ready `FlowRing` handles, fed by the
//! classifier whenever an attached ring moves past its attachment snapshot.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::flow::FlowRing;
use crate::ring::RingSpscWaiter;

/// Poll ring capacity (ready-ring notifications in flight).
pub const POLL_RING_SIZE: usize = 128;

/// Readiness ring for a multiplexing consumer.
///
/// Producer is the classifier thread the poller is bound to; consumer is
/// the unique [`PollReceiver`]. Notifications are edge-triggered per
/// attachment and may repeat; a full ring drops the notification but the
/// poller is still woken.
pub struct PollRing {
    ring: RingSpscWaiter<Arc<FlowRing>, POLL_RING_SIZE>,
    /// Classifier id this poller is bound to; 0 until the first attach.
    owner: AtomicUsize,
}

impl PollRing {
    /// Create a poll ring, returning the shared handle attachments are
    /// registered with and the unique consumer endpoint.
    pub fn new() -> (Arc<PollRing>, PollReceiver) {
        let ring = Arc::new(PollRing {
            ring: RingSpscWaiter::new(),
            owner: AtomicUsize::new(0),
        });
        let receiver = PollReceiver { ring: ring.clone() };
        (ring, receiver)
    }

    /// Ready notifications currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.ring.size()
    }

    /// True when no notifications are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.size() == 0
    }

    /// Enqueue a ready ring. Classifier thread only. Returns `false` when
    /// the notification was dropped on overflow.
    #[inline]
    pub(crate) fn push_ready(&self, ring: Arc<FlowRing>) -> bool {
        // SAFETY: the classifier binding (bind_owner) guarantees a single
        // producer thread for the poller's lifetime.
        unsafe { self.ring.push(ring) }.is_ok()
    }

    /// Wake the parked poller, if any. Classifier thread only.
    #[inline]
    pub(crate) fn wake(&self) {
        self.ring.wake_consumer();
    }

    /// Bind this poller to classifier `id`; idempotent for the same id,
    /// refused for a different one.
    pub(crate) fn bind_owner(&self, id: usize) -> bool {
        match self
            .owner
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == id,
        }
    }
}

impl fmt::Debug for PollRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollRing").field("len", &self.len()).finish()
    }
}

/// Unique consumer endpoint of a [`PollRing`].
pub struct PollReceiver {
    ring: Arc<PollRing>,
}

impl PollReceiver {
    /// The shared poll-ring handle (for attach/detach registration).
    #[inline]
    pub fn ring(&self) -> &Arc<PollRing> {
        &self.ring
    }

    /// Dequeue the oldest ready ring, if any.
    #[inline]
    pub fn pop(&mut self) -> Option<Arc<FlowRing>> {
        // SAFETY: self is the poller's unique consumer endpoint.
        unsafe { self.ring.ring.pop() }
    }

    /// Park until a readiness notification arrives.
    pub fn wait(&mut self) {
        tracing::trace!("poll ring waiting");
        self.ring.ring.wait_for_items();
        tracing::trace!("poll ring done waiting");
    }
}

impl fmt::Debug for PollReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollReceiver").finish_non_exhaustive()
    }
}
