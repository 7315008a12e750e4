//! Lock-free single-producer single-consumer ring buffers
//!
//! The trade-engine seam: three of these connect the engine to the
//! bridge (requests in, responses out, market updates out). Capacity is
//! fixed at construction; `push` fails when the ring is full rather
//! than blocking, and `pop` returns `None` when empty. Head and tail
//! indices live on separate cache lines.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Ring<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to read. Only the consumer stores to this.
    head: CachePadded<AtomicUsize>,
    /// Next slot to write. Only the producer stores to this.
    tail: CachePadded<AtomicUsize>,
}

// The ring is shared between exactly one producer and one consumer;
// slot ownership is transferred through the acquire/release index pair.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        // One slot is kept empty to distinguish full from empty.
        let slots = capacity + 1;
        let buf = (0..slots)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    fn next_index(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.buf.len() {
            0
        } else {
            next
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        while head != tail {
            unsafe {
                (*self.buf[head].get()).assume_init_drop();
            }
            head = self.next_index(head);
        }
    }
}

/// Writing half of an SPSC queue. Not clonable: the single-producer
/// contract is enforced by ownership.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

/// Reading half of an SPSC queue.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

/// Create a bounded SPSC channel with the given capacity.
pub fn spsc_channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let ring = Arc::new(Ring::with_capacity(capacity));
    (
        Producer { ring: ring.clone() },
        Consumer { ring },
    )
}

impl<T> Producer<T> {
    /// Append a value, or hand it back if the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let next = self.ring.next_index(tail);
        if next == self.ring.head.load(Ordering::Acquire) {
            return Err(value);
        }
        unsafe {
            (*self.ring.buf[tail].get()).write(value);
        }
        self.ring.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Number of entries currently readable.
    pub fn len(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            tail + self.ring.buf.len() - head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Consumer<T> {
    /// Take the next value in FIFO order, if any.
    pub fn pop(&mut self) -> Option<T> {
        let head = self.ring.head.load(Ordering::Relaxed);
        if head == self.ring.tail.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*self.ring.buf[head].get()).assume_init_read() };
        self.ring.head.store(self.ring.next_index(head), Ordering::Release);
        Some(value)
    }

    /// Number of entries currently readable.
    pub fn len(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Acquire);
        let head = self.ring.head.load(Ordering::Relaxed);
        if tail >= head {
            tail - head
        } else {
            tail + self.ring.buf.len() - head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
