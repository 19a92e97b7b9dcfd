//! netchannel: per-flow packet classification and delivery
//!
//! The receive-side core of a kernel-bypass TCP path: frames arriving on
//! one interface are matched against registered 5-tuples and handed to
//! per-flow lock-free rings, waking the flow's consumer; everything else
//! goes back to the caller for conventional stack processing.
//!
//! # Architecture
//!
//! ```text
//!   driver (rx thread)                     socket / poll threads
//!        │                                        │
//!        ▼                                        ▼
//!  ┌───────────────┐   control msgs (MPSC)  ┌───────────┐
//!  │  Classifier   │◀───────────────────────│  Handle   │ add / remove /
//!  │               │                        └───────────┘ attach / detach
//!  │ drain control │
//!  │ decode tuple  │
//!  │ RCU lookup    │
//!  └──────┬────────┘
//!         │ push + wake
//!         ▼
//!  ┌───────────────┐      pop / wait       ┌────────────┐
//!  │   FlowRing    │──────────────────────▶│ FlowReceiver│ (socket thread)
//!  │  (SPSC 1024)  │                       └────────────┘
//!  └──────┬────────┘
//!         │ readiness (snapshot passed)
//!         ▼
//!  ┌───────────────┐      pop / wait       ┌────────────┐
//!  │   PollRing    │──────────────────────▶│ PollReceiver│ (poller thread)
//!  └───────────────┘                       └────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Per flow, frames reach the consumer in the order the driver supplied
//!   them; there is no ordering across flows
//! - A consumer that observes an empty ring and parks is woken by any
//!   producer that pushes after the park decision
//! - Control messages apply strictly before the lookup of the `try_deliver`
//!   call that drains them; after a `remove` has been drained, no further
//!   push to that ring occurs
//! - Frames are exclusively owned at every stage; a successful push
//!   transfers ownership to the ring's consumer

#![warn(missing_docs)]

pub mod classifier;
pub mod error;
pub mod flow;
pub mod frame;
pub mod poll;
pub mod queue;
pub mod rcu;
pub mod ring;
pub mod stats;
pub mod waitq;

pub use classifier::{
    Classifier, ClassifierConfig, ClassifierHandle, ETHER_HDR_LEN, IPPROTO_TCP, IPV4_HDR_MIN,
    TCP_HDR_MIN,
};
pub use error::{Error, Result};
pub use flow::{FlowKey, FlowReceiver, FlowRing, SocketId, RCV_RING_SIZE};
pub use frame::{Frame, FramePool, DEFAULT_FRAME_CAPACITY};
pub use poll::{PollReceiver, PollRing, POLL_RING_SIZE};
pub use ring::Snapshot;
pub use stats::{ClassifierStats, ClassifierStatsSnapshot};
