//! Flow Classifier
//!
//! Routes raw Ethernet/IPv4/TCP frames to registered per-flow rings. One
//! classifier exists per network interface; all of its state is mutated on
//! the receive thread only.
//!
//! # Design
//!
//! - The index is an RCU hash map keyed by the tuple XOR, owned by the
//!   classifier thread
//! - Every mutation arrives as a control message over the MPSC queue and is
//!   applied at the head of `try_deliver`, so control order is delivery
//!   order and the index never changes mid-lookup
//! - Incoming packets are rekeyed source/destination-swapped: flows are
//!   indexed from the local endpoint's perspective
//! - Overflowed deliveries are dropped and counted; the consumer not
//!   keeping up is that flow's problem, not the interface's

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::flow::{FlowKey, FlowRing, TupleHashBuilder};
use crate::frame::Frame;
use crate::poll::PollRing;
use crate::queue::Queue;
use crate::rcu::{self, RcuHashMap, RcuReadHandle};
use crate::ring::Snapshot;
use crate::stats::ClassifierStats;

/// Ethernet-II header length.
pub const ETHER_HDR_LEN: usize = 14;
/// Minimum IPv4 header length.
pub const IPV4_HDR_MIN: usize = 20;
/// Minimum TCP header length.
pub const TCP_HDR_MIN: usize = 20;
/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

static NEXT_CLASSIFIER_ID: AtomicUsize = AtomicUsize::new(1);

/// Classifier configuration.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Initial index bucket count; must be a power of two.
    pub initial_buckets: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { initial_buckets: 1 }
    }
}

/// Control message posted to the classifier; applied in FIFO order at the
/// head of every `try_deliver`.
enum ControlMsg {
    Add {
        key: FlowKey,
        ring: Arc<FlowRing>,
    },
    Remove {
        key: FlowKey,
    },
    AttachPoller {
        ring: Arc<FlowRing>,
        snapshot: Snapshot,
        poller: Arc<PollRing>,
    },
    DetachPoller {
        ring: Arc<FlowRing>,
        poller: Arc<PollRing>,
    },
    DestroyPoller {
        poller: Arc<PollRing>,
    },
}

/// One poller registered against a flow ring, with the producer index it
/// last observed.
struct PollerAttachment {
    poller: Arc<PollRing>,
    snapshot: Snapshot,
}

/// Attachment list for one ring. Holds the ring alive so the map key (its
/// address) cannot be reused while attachments remain.
struct RingAttachments {
    ring: Arc<FlowRing>,
    pollers: Vec<PollerAttachment>,
}

/// Any-thread handle for posting control operations to a classifier.
///
/// Every method is O(1) and wait-free for the caller; the operation takes
/// effect when the classifier next drains its control queue.
#[derive(Clone)]
pub struct ClassifierHandle {
    control: Arc<Queue<ControlMsg>>,
}

impl ClassifierHandle {
    /// Register `ring` under `key`, overwriting any existing registration.
    pub fn add(&self, key: FlowKey, ring: Arc<FlowRing>) {
        tracing::debug!(?key, socket = ring.socket(), "classifier add");
        self.control.push(ControlMsg::Add { key, ring });
    }

    /// Deregister `key`; no error if absent. The socket layer may destroy
    /// the ring only after a subsequent `try_deliver` has returned.
    pub fn remove(&self, key: FlowKey) {
        tracing::debug!(?key, "classifier remove");
        self.control.push(ControlMsg::Remove { key });
    }

    /// Attach `poller` to `ring` at `snapshot`. If the ring has already
    /// moved past the snapshot, the attach itself fires the poller once.
    pub fn attach_poller(&self, ring: Arc<FlowRing>, snapshot: Snapshot, poller: Arc<PollRing>) {
        self.control.push(ControlMsg::AttachPoller {
            ring,
            snapshot,
            poller,
        });
    }

    /// Detach `poller` from `ring`.
    pub fn detach_poller(&self, ring: Arc<FlowRing>, poller: Arc<PollRing>) {
        self.control.push(ControlMsg::DetachPoller { ring, poller });
    }

    /// Release the classifier's reference to `poller`. Must be posted after
    /// every detach for the poller; the queue's FIFO order makes the drop
    /// safe.
    pub fn destroy_poller(&self, poller: Arc<PollRing>) {
        self.control.push(ControlMsg::DestroyPoller { poller });
    }
}

/// Per-interface flow classifier.
///
/// Owned and driven by the receive thread: `try_deliver` takes `&mut self`
/// and must never run concurrently with itself. Control producers post
/// through [`ClassifierHandle`]s.
pub struct Classifier {
    id: usize,
    index: RcuHashMap<FlowKey, Arc<FlowRing>, TupleHashBuilder>,
    attachments: HashMap<usize, RingAttachments>,
    control: Arc<Queue<ControlMsg>>,
    stats: Arc<ClassifierStats>,
}

impl Classifier {
    /// Create a classifier.
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        if !config.initial_buckets.is_power_of_two() {
            return Err(Error::Config(format!(
                "initial_buckets must be a power of two, got {}",
                config.initial_buckets
            )));
        }
        Ok(Self {
            id: NEXT_CLASSIFIER_ID.fetch_add(1, Ordering::Relaxed),
            index: RcuHashMap::with_hasher(config.initial_buckets, TupleHashBuilder),
            attachments: HashMap::new(),
            control: Arc::new(Queue::new()),
            stats: Arc::new(ClassifierStats::default()),
        })
    }

    /// A cloneable control handle usable from any thread.
    pub fn handle(&self) -> ClassifierHandle {
        ClassifierHandle {
            control: self.control.clone(),
        }
    }

    /// Shared counter block.
    pub fn stats(&self) -> Arc<ClassifierStats> {
        self.stats.clone()
    }

    /// A wait-free read handle onto the flow index (diagnostics; the
    /// delivery path does its own lookups).
    pub fn index_reader(&self) -> RcuReadHandle<FlowKey, Arc<FlowRing>, TupleHashBuilder> {
        self.index.read_handle()
    }

    /// Registered flow count, as of the last control drain.
    pub fn flow_count(&self) -> usize {
        self.index.len()
    }

    /// See [`ClassifierHandle::add`].
    pub fn add(&self, key: FlowKey, ring: Arc<FlowRing>) {
        self.handle().add(key, ring);
    }

    /// See [`ClassifierHandle::remove`].
    pub fn remove(&self, key: FlowKey) {
        self.handle().remove(key);
    }

    /// See [`ClassifierHandle::attach_poller`].
    pub fn attach_poller(&self, ring: Arc<FlowRing>, snapshot: Snapshot, poller: Arc<PollRing>) {
        self.handle().attach_poller(ring, snapshot, poller);
    }

    /// See [`ClassifierHandle::detach_poller`].
    pub fn detach_poller(&self, ring: Arc<FlowRing>, poller: Arc<PollRing>) {
        self.handle().detach_poller(ring, poller);
    }

    /// See [`ClassifierHandle::destroy_poller`].
    pub fn destroy_poller(&self, poller: Arc<PollRing>) {
        self.handle().destroy_poller(poller);
    }

    /// Try to deliver one received frame.
    ///
    /// Receive-thread only. Returns `None` when the frame was consumed
    /// (delivered to a flow ring, or claimed and dropped on overflow) and
    /// `Some(frame)` with the untouched frame when it was not claimed and
    /// the caller should fall back to the conventional path.
    pub fn try_deliver(&mut self, frame: Frame) -> Option<Frame> {
        // Drain control first: registrations posted before this frame
        // arrived take effect for it, whatever the frame turns out to be.
        self.process_control();

        let key = match decode_swapped_tuple(frame.data()) {
            Decode::Short => {
                self.stats.record_unclaimed_short();
                tracing::trace!(len = frame.len(), "frame not delivered: too short");
                return Some(frame);
            }
            Decode::NotTcp { ip_proto } => {
                self.stats.record_unclaimed_not_tcp();
                tracing::trace!(ip_proto, len = frame.len(), "frame not delivered: not tcp");
                return Some(frame);
            }
            Decode::Flow(key) => key,
        };

        let ring = match self.lookup(&key) {
            Some(ring) => ring,
            None => {
                self.stats.record_unclaimed_no_match();
                return Some(frame);
            }
        };

        match ring.push(frame) {
            Err(dropped) => {
                // Claimed but the consumer is not keeping up: drop policy.
                self.stats.record_dropped();
                tracing::trace!(socket = ring.socket(), "frame dropped: flow ring full");
                drop(dropped);
                None
            }
            Ok(()) => {
                self.stats.record_delivered();
                tracing::trace!(socket = ring.socket(), "frame delivered");
                ring.wake_consumer();
                self.stats.record_consumer_wake();
                self.fire_pollers(&ring);
                None
            }
        }
    }

    /// Apply every queued control message, oldest first. The only place the
    /// index or the attachment registry mutate.
    fn process_control(&mut self) {
        // SAFETY: the classifier is the queue's only consumer.
        while let Some(msg) = unsafe { self.control.pop() } {
            self.stats.record_control();
            self.apply(msg);
        }
    }

    fn apply(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Add { key, ring } => {
                if !ring.bind_owner(self.id) {
                    tracing::warn!(
                        ?key,
                        socket = ring.socket(),
                        "add refused: ring bound to another classifier"
                    );
                    return;
                }
                self.index.insert(key, ring);
            }
            ControlMsg::Remove { key } => {
                self.index.remove(&key);
            }
            ControlMsg::AttachPoller {
                ring,
                snapshot,
                poller,
            } => {
                if !poller.bind_owner(self.id) {
                    tracing::warn!("attach refused: poller bound to another classifier");
                    return;
                }
                let mut attachment = PollerAttachment { poller, snapshot };
                // Reconcile missed edges: anything pushed between the
                // caller's snapshot and this apply fires the poller now.
                if ring.modified_since(attachment.snapshot) {
                    Self::fire(&self.stats, &mut attachment, &ring);
                }
                self.attachments
                    .entry(Arc::as_ptr(&ring) as usize)
                    .or_insert_with(|| RingAttachments {
                        ring,
                        pollers: Vec::new(),
                    })
                    .pollers
                    .push(attachment);
            }
            ControlMsg::DetachPoller { ring, poller } => {
                let key = Arc::as_ptr(&ring) as usize;
                if let Some(entry) = self.attachments.get_mut(&key) {
                    entry
                        .pollers
                        .retain(|a| !Arc::ptr_eq(&a.poller, &poller));
                    if entry.pollers.is_empty() {
                        self.attachments.remove(&key);
                    }
                }
            }
            ControlMsg::DestroyPoller { poller } => {
                // Every earlier detach for this poller is already applied
                // (queue FIFO), so dropping the reference is safe.
                debug_assert!(
                    self.attachments
                        .values()
                        .all(|e| e.pollers.iter().all(|a| !Arc::ptr_eq(&a.poller, &poller))),
                    "poller destroyed while attachments remain"
                );
                drop(poller);
            }
        }
    }

    fn lookup(&self, key: &FlowKey) -> Option<Arc<FlowRing>> {
        let guard = rcu::pin();
        match self.index.find(key, &guard) {
            Some(ring) => {
                tracing::trace!(?key, "classifier lookup found");
                Some(ring.clone())
            }
            None => {
                tracing::trace!(?key, "classifier lookup not found");
                None
            }
        }
    }

    /// Notify every poller attached to `ring` whose snapshot is stale.
    fn fire_pollers(&mut self, ring: &Arc<FlowRing>) {
        if self.attachments.is_empty() {
            return;
        }
        if let Some(entry) = self.attachments.get_mut(&(Arc::as_ptr(ring) as usize)) {
            for attachment in entry.pollers.iter_mut() {
                if ring.modified_since(attachment.snapshot) {
                    Self::fire(&self.stats, attachment, ring);
                }
            }
        }
    }

    fn fire(stats: &ClassifierStats, attachment: &mut PollerAttachment, ring: &Arc<FlowRing>) {
        attachment.snapshot = ring.snapshot();
        if !attachment.poller.push_ready(ring.clone()) {
            tracing::trace!("poll notification dropped: poll ring full");
        }
        attachment.poller.wake();
        stats.record_poll_wake();
    }
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("id", &self.id)
            .field("flows", &self.index.len())
            .finish()
    }
}

enum Decode {
    Short,
    NotTcp { ip_proto: u8 },
    Flow(FlowKey),
}

/// Decode the swapped lookup tuple from an Ethernet/IPv4/TCP prefix.
///
/// The returned key carries the frame's destination as source and vice
/// versa, matching the local-endpoint orientation of the index.
#[inline]
fn decode_swapped_tuple(data: &[u8]) -> Decode {
    if data.len() < ETHER_HDR_LEN + IPV4_HDR_MIN {
        return Decode::Short;
    }

    let ip = &data[ETHER_HDR_LEN..];
    let hlen = usize::from(ip[0] & 0x0f) << 2;
    let ip_proto = ip[9];
    let src_ip = u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]]);
    let dst_ip = u32::from_be_bytes([ip[16], ip[17], ip[18], ip[19]]);

    if ip_proto != IPPROTO_TCP || data.len() < ETHER_HDR_LEN + hlen + TCP_HDR_MIN {
        return Decode::NotTcp { ip_proto };
    }

    let tcp = &data[ETHER_HDR_LEN + hlen..];
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);

    Decode::Flow(FlowKey::new(dst_ip, src_ip, ip_proto, dst_port, src_port))
}
