//! Flow Keys and Flow Rings
//!
//! The 5-tuple a flow is indexed under, and the per-flow SPSC endpoint that
//! carries classified frames to their socket's receive thread.

use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::frame::Frame;
use crate::ring::{RingSpscWaiter, Snapshot};

/// Per-flow receive ring capacity.
pub const RCV_RING_SIZE: usize = 1024;

/// Opaque identifier of the socket owning a flow ring.
pub type SocketId = u64;

/// 5-tuple identifying a flow.
///
/// Equality is structural. Addresses and ports hold the values the socket
/// layer registered; an incoming packet is rekeyed with [`reverse`]
/// semantics before lookup (the index is kept from the local endpoint's
/// perspective).
///
/// [`reverse`]: FlowKey::reverse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FlowKey {
    /// Source IPv4 address.
    pub src_ip: u32,
    /// Destination IPv4 address.
    pub dst_ip: u32,
    /// IP protocol number (TCP = 6).
    pub ip_proto: u8,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
}

impl FlowKey {
    /// Create a flow key.
    pub const fn new(src_ip: u32, dst_ip: u32, ip_proto: u8, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            ip_proto,
            src_port,
            dst_port,
        }
    }

    /// The reply direction: addresses and ports swapped.
    #[inline(always)]
    pub const fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            ip_proto: self.ip_proto,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// XOR of all tuple fields widened to a machine word.
    #[inline(always)]
    pub fn tuple_hash(&self) -> u64 {
        u64::from(self.src_ip)
            ^ u64::from(self.dst_ip)
            ^ u64::from(self.ip_proto)
            ^ u64::from(self.src_port)
            ^ u64::from(self.dst_port)
    }
}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.tuple_hash());
    }
}

/// Write-through hasher: with [`FlowKey`]'s single `write_u64`, the
/// finished hash is exactly the tuple XOR, so a power-of-two bucket index
/// is `xor & (buckets - 1)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TupleHasher(u64);

impl Hasher for TupleHasher {
    #[inline(always)]
    fn finish(&self) -> u64 {
        self.0
    }

    #[inline(always)]
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(b);
        }
    }

    #[inline(always)]
    fn write_u64(&mut self, i: u64) {
        self.0 ^= i;
    }
}

/// Builder for [`TupleHasher`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TupleHashBuilder;

impl BuildHasher for TupleHashBuilder {
    type Hasher = TupleHasher;

    #[inline(always)]
    fn build_hasher(&self) -> TupleHasher {
        TupleHasher(0)
    }
}

/// Per-flow frame ring.
///
/// Producer is the classifier thread the ring is bound to; consumer is the
/// unique [`FlowReceiver`] returned at construction. Created by the socket
/// layer when a flow is registered; the socket layer must destroy it only
/// after a deregistration round-trip: post `remove(key)`, then observe one
/// further `try_deliver` return on that classifier.
pub struct FlowRing {
    ring: RingSpscWaiter<Frame, RCV_RING_SIZE>,
    socket: SocketId,
    /// Classifier id this ring is bound to; 0 until the first `Add`.
    owner: AtomicUsize,
}

impl FlowRing {
    /// Create a ring for `socket`'s flow, returning the shared handle the
    /// classifier is registered with and the unique consumer endpoint.
    pub fn new(socket: SocketId) -> (Arc<FlowRing>, FlowReceiver) {
        let ring = Arc::new(FlowRing {
            ring: RingSpscWaiter::new(),
            socket,
            owner: AtomicUsize::new(0),
        });
        let receiver = FlowReceiver { ring: ring.clone() };
        (ring, receiver)
    }

    /// The owning socket.
    #[inline]
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Frames currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.ring.size()
    }

    /// True when no frames are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.size() == 0
    }

    /// Capture the ring's producer index.
    #[inline]
    pub fn snapshot(&self) -> Snapshot {
        self.ring.snapshot()
    }

    /// Has a frame been pushed since `snapshot`?
    #[inline]
    pub fn modified_since(&self, snapshot: Snapshot) -> bool {
        self.ring.modified_since(snapshot)
    }

    /// Enqueue a frame. Classifier thread only.
    #[inline]
    pub(crate) fn push(&self, frame: Frame) -> Result<(), Frame> {
        // SAFETY: the classifier binding (bind_owner) guarantees a single
        // producer thread for the ring's lifetime.
        unsafe { self.ring.push(frame) }
    }

    /// Wake the parked consumer, if any. Classifier thread only.
    #[inline]
    pub(crate) fn wake_consumer(&self) {
        self.ring.wake_consumer();
    }

    /// Bind this ring to classifier `id`; idempotent for the same id,
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

impl fmt::Debug for FlowRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRing")
            .field("socket", &self.socket)
            .field("len", &self.len())
            .finish()
    }
}

/// Unique consumer endpoint of a [`FlowRing`].
///
/// Exactly one exists per ring; `pop` and `wait` take `&mut self`, so the
/// single-consumer contract is enforced by the type system.
pub struct FlowReceiver {
    ring: Arc<FlowRing>,
}

impl FlowReceiver {
    /// The shared ring handle (for registration and snapshots).
    #[inline]
    pub fn ring(&self) -> &Arc<FlowRing> {
        &self.ring
    }

    /// The owning socket.
    #[inline]
    pub fn socket(&self) -> SocketId {
        self.ring.socket
    }

    /// Dequeue the oldest frame, if any.
    #[inline]
    pub fn pop(&mut self) -> Option<Frame> {
        // SAFETY: self is the ring's unique consumer endpoint.
        let frame = unsafe { self.ring.ring.pop() };
        if frame.is_some() {
            tracing::trace!(socket = self.ring.socket, "flow ring frame popped");
        }
        frame
    }

    /// Park until the ring is nonempty.
    pub fn wait(&mut self) {
        tracing::trace!(socket = self.ring.socket, "flow ring waiting");
        self.ring.ring.wait_for_items();
        tracing::trace!(socket = self.ring.socket, "flow ring done waiting");
    }
}

impl fmt::Debug for FlowReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowReceiver")
            .field("socket", &self.ring.socket)
            .finish()
    }
}
