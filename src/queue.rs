//! Intrusive MPSC Queue
//!
//! Unbounded multi-producer/single-consumer FIFO carrying the classifier's
//! control messages.
//!
//! # Design
//!
//! - Exchange-tail push: producers swap the tail pointer and link the old
//!   tail, two wait-free steps
//! - Single-owner head: the consumer walks acquire-loaded next links from a
//!   stub node
//! - FIFO per producer; the tail exchange linearises a total order across
//!   producers
//! - Nodes are allocated by the sender and freed by the consumer after the
//!   value is taken

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Unbounded intrusive MPSC FIFO.
///
/// Any number of threads may [`push`](Self::push); exactly one thread owns
/// [`pop`](Self::pop).
pub struct Queue<T> {
    /// Consumer-owned cursor; always points at the current stub.
    head: UnsafeCell<*mut Node<T>>,
    tail: AtomicPtr<Node<T>>,
}

// SAFETY: head is touched only by the single consumer (pop is unsafe and
// documents that contract); tail and the next links are atomic.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let stub = Node::boxed(None);
        Self {
            head: UnsafeCell::new(stub),
            tail: AtomicPtr::new(stub),
        }
    }

    /// Append a value. Wait-free; callable from any thread.
    pub fn push(&self, value: T) {
        let node = Node::boxed(Some(value));
        // The queue is momentarily unlinked between the swap and the store;
        // the consumer treats the gap as empty and retries on its next
        // drain. Order among fully-linked nodes is the swap order.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // SAFETY: prev is a live node; only this producer links its next.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Remove the oldest fully-linked value, if any.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only consumer for the duration of the call.
    pub unsafe fn pop(&self) -> Option<T> {
        let head_slot = self.head.get();
        // SAFETY: consumer-exclusive cursor.
        let head = unsafe { *head_slot };
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }

        // The successor becomes the new stub; its value moves out and the
        // old stub is freed.
        let value = unsafe { (*next).value.take() };
        unsafe {
            *head_slot = next;
            drop(Box::from_raw(head));
        }
        debug_assert!(value.is_some());
        value
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: exclusive access; every node in the chain is live.
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
        }
    }
}
