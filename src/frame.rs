//! Frame Handles
//!
//! Exclusively-owned received-frame buffers and the pre-allocated pool
//! backing them.
//!
//! # Design
//!
//! - A `Frame` owns one contiguous byte region; dropping it frees the frame
//!   (returning the backing buffer to its pool)
//! - Ownership transfers on every hand-off: driver → classifier → flow ring
//!   → consumer; nothing is ever shared
//! - The pool's free-list is a lock-free `ArrayQueue`, so alloc/free never
//!   block the receive path

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default backing-buffer capacity: one MTU-sized frame with slack.
pub const DEFAULT_FRAME_CAPACITY: usize = 2048;

/// An exclusively-owned received link-layer frame.
///
/// The byte region is contiguous and starts at the link-layer header.
/// Dropping the frame frees it.
pub struct Frame {
    data: Vec<u8>,
    pool: Option<Arc<FramePool>>,
}

impl Frame {
    /// Adopt an external buffer as a frame (driver integration, tests).
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }

    /// Frame contents.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable frame contents.
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Frame length in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the frame carries no bytes.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append bytes to the frame.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drop all contents, keeping the backing capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// Pre-allocated frame pool with a lock-free free-list.
pub struct FramePool {
    free: ArrayQueue<Vec<u8>>,
    frame_capacity: usize,
    size: usize,
    outstanding: AtomicUsize,
}

impl FramePool {
    /// Create a pool of `size` buffers of `frame_capacity` bytes each.
    pub fn new(size: usize, frame_capacity: usize) -> Arc<Self> {
        let free = ArrayQueue::new(size);
        for _ in 0..size {
            let _ = free.push(Vec::with_capacity(frame_capacity));
        }
        Arc::new(Self {
            free,
            frame_capacity,
            size,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Take an empty frame from the pool; `None` when exhausted.
    pub fn alloc(self: &Arc<Self>) -> Option<Frame> {
        let data = self.free.pop()?;
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Some(Frame {
            data,
            pool: Some(self.clone()),
        })
    }

    /// Take a frame pre-filled with `bytes`.
    pub fn alloc_from(self: &Arc<Self>, bytes: &[u8]) -> Option<Frame> {
        let mut frame = self.alloc()?;
        frame.extend_from_slice(bytes);
        Some(frame)
    }

    fn release(&self, mut data: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        data.clear();
        // A buffer grown past the pool's capacity class would bloat the
        // pool; let it deallocate and refill lazily instead.
        if data.capacity() >= self.frame_capacity {
            let _ = self.free.push(data);
        } else {
            let _ = self.free.push(Vec::with_capacity(self.frame_capacity));
        }
    }

    /// Buffers currently available for allocation.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Frames currently held by callers.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Total pool size.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}
