use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded lock-free single-producer/single-consumer FIFO.
///
/// One slot is sacrificed to distinguish full from empty, so the ring holds
/// at most `capacity` values. The producer publishes a slot with a release
/// store of the tail index; the consumer acquires it before reading, which
/// is the only synchronization on the hand-off. Writes fail only on full,
/// reads fail only on empty, and order is preserved end-to-end.
pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot the consumer will read. Written only by the consumer.
    head: AtomicUsize,
    /// Next slot the producer will write. Written only by the producer.
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Create a ring holding up to `capacity` values.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");

        let slots = (0..capacity + 1)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of values currently queued. Approximate under concurrency.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.slots.len() - head) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: enqueue a value, handing it back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.slots.len();

        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }

        // Safety: `tail` is owned by the single producer and the slot is
        // outside the consumer's visible range until the release store below.
        unsafe {
            (*self.slots[tail].get()).write(value);
        }
        self.tail.store(next, Ordering::Release);

        Ok(())
    }

    /// Consumer side: dequeue the oldest value.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // Safety: the acquire load above orders this read after the
        // producer's write; the slot leaves the producer's range once the
        // head store below is visible.
        let value = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.store((head + 1) % self.slots.len(), Ordering::Release);

        Some(value)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
