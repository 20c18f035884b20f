//! Fixed capacity byte queue between a producer (e.g. a UART interrupt) and the log.
//!
//! One slot is always kept empty to tell a full buffer from an empty one, so a `RingBuffer<N>`
//! holds at most `N - 1` bytes. `N` has to be a power of two to allow wrapping with a bit mask.
//!
//! The buffer itself can be used from a single context through `&mut self`. For a producer and a
//! consumer living in different contexts, `split` hands out a `Producer` and a `Consumer` which
//! only ever touch their own index.

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct RingBuffer<const N: usize> {
    head: AtomicUsize,
    tail: AtomicUsize,
    data: [UnsafeCell<u8>; N],
}

// Safety: slots are only written through `&mut self` or the single `Producer` and only read
// through `&mut self` or the single `Consumer`. Both halves borrow the buffer mutably on `split`.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RingBuffer<N> {
    const MASK: usize = N - 1;

    pub const fn new() -> Self {
        const { assert!(N >= 2 && N.is_power_of_two(), "capacity must be a power of two") };
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            data: [const { UnsafeCell::new(0) }; N],
        }
    }

    /// Returns the byte back if the buffer is full.
    pub fn add(&mut self, byte: u8) -> Result<(), u8> {
        // Safety: `&mut self` excludes any other producer
        unsafe { self.enqueue(byte) }
    }

    pub fn remove(&mut self) -> Option<u8> {
        // Safety: `&mut self` excludes any other consumer
        unsafe { self.dequeue() }
    }

    /// Drops all queued bytes.
    pub fn reset(&mut self) {
        self.discard();
    }

    /// Number of queued bytes.
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & Self::MASK
    }

    /// Maximum number of queued bytes.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        let rb: &Self = self;
        (Producer { rb }, Consumer { rb })
    }

    /// # Safety
    /// The caller has to be the only producer.
    unsafe fn enqueue(&self, byte: u8) -> Result<(), u8> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & Self::MASK;
        if next == self.tail.load(Ordering::Acquire) {
            return Err(byte);
        }
        unsafe { *self.data[head].get() = byte };
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// # Safety
    /// The caller has to be the only consumer.
    unsafe fn dequeue(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let byte = unsafe { *self.data[tail].get() };
        self.tail.store((tail + 1) & Self::MASK, Ordering::Release);
        Some(byte)
    }

    fn discard(&self) {
        self.tail
            .store(self.head.load(Ordering::Acquire), Ordering::Release);
    }
}

/// Filling half of a split `RingBuffer`.
pub struct Producer<'a, const N: usize> {
    rb: &'a RingBuffer<N>,
}

impl<const N: usize> Producer<'_, N> {
    /// Returns the byte back if the buffer is full.
    pub fn add(&mut self, byte: u8) -> Result<(), u8> {
        // Safety: there is exactly one producer per split
        unsafe { self.rb.enqueue(byte) }
    }

    pub fn count(&self) -> usize {
        self.rb.count()
    }

    pub const fn capacity(&self) -> usize {
        self.rb.capacity()
    }
}

/// Draining half of a split `RingBuffer`.
pub struct Consumer<'a, const N: usize> {
    rb: &'a RingBuffer<N>,
}

impl<const N: usize> Consumer<'_, N> {
    pub fn remove(&mut self) -> Option<u8> {
        // Safety: there is exactly one consumer per split
        unsafe { self.rb.dequeue() }
    }

    /// Drops all queued bytes.
    pub fn reset(&mut self) {
        self.rb.discard();
    }

    pub fn count(&self) -> usize {
        self.rb.count()
    }

    pub const fn capacity(&self) -> usize {
        self.rb.capacity()
    }
}

/// Bytes to be written into the log.
pub trait ByteSource {
    fn remove(&mut self) -> Option<u8>;

    fn count(&self) -> usize;

    fn capacity(&self) -> usize;
}

/// Receives bytes read from the log.
pub trait ByteSink {
    /// Returns the byte back if there is no room for it right now.
    fn add(&mut self, byte: u8) -> Result<(), u8>;
}

impl<S: ByteSource> ByteSource for &mut S {
    fn remove(&mut self) -> Option<u8> {
        (**self).remove()
    }

    fn count(&self) -> usize {
        (**self).count()
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }
}

impl<S: ByteSink> ByteSink for &mut S {
    fn add(&mut self, byte: u8) -> Result<(), u8> {
        (**self).add(byte)
    }
}

impl<const N: usize> ByteSource for RingBuffer<N> {
    fn remove(&mut self) -> Option<u8> {
        RingBuffer::remove(self)
    }

    fn count(&self) -> usize {
        RingBuffer::count(self)
    }

    fn capacity(&self) -> usize {
        RingBuffer::capacity(self)
    }
}

impl<const N: usize> ByteSink for RingBuffer<N> {
    fn add(&mut self, byte: u8) -> Result<(), u8> {
        RingBuffer::add(self, byte)
    }
}

impl<const N: usize> ByteSource for Consumer<'_, N> {
    fn remove(&mut self) -> Option<u8> {
        Consumer::remove(self)
    }

    fn count(&self) -> usize {
        Consumer::count(self)
    }

    fn capacity(&self) -> usize {
        Consumer::capacity(self)
    }
}

impl<const N: usize> ByteSink for Producer<'_, N> {
    fn add(&mut self, byte: u8) -> Result<(), u8> {
        Producer::add(self, byte)
    }
}

/// Collects a whole item in memory.
impl ByteSink for Vec<u8> {
    fn add(&mut self, byte: u8) -> Result<(), u8> {
        self.push(byte);
        Ok(())
    }
}
