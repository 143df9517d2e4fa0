//! Bounded lock-free queue of 64-bit values placed in shared memory
//!
//! Each cell carries its own sequence: a producer may only write a cell
//! whose sequence equals the producer position, a consumer may only read a
//! cell whose sequence is one past the consumer position. Positions are
//! claimed with compare-and-swap, so any number of producers and consumers
//! from any process can operate on the same queue.

use std::{
    mem::size_of,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::memory::CACHE_LINE_SIZE;

/// Shared header of an index queue
#[repr(C, align(64))]
pub struct QueueHeader {
    /// Next position to pop
    head: AtomicU64,
    _pad0: [u8; CACHE_LINE_SIZE - 8],
    /// Next position to push
    tail: AtomicU64,
    /// Number of cells
    capacity: u64,
    _pad1: [u8; CACHE_LINE_SIZE - 16],
}

/// One queue cell
#[repr(C)]
pub struct QueueCell {
    sequence: AtomicU64,
    value: AtomicU64,
}

/// View onto a queue living in shared memory
#[derive(Debug, Clone, Copy)]
pub struct IndexQueue {
    header: *const QueueHeader,
    cells: *const QueueCell,
    capacity: u64,
}

// SAFETY: all access goes through atomics
unsafe impl Send for IndexQueue {}
unsafe impl Sync for IndexQueue {}

impl IndexQueue {
    /// Bytes needed for a queue of `capacity` cells, a multiple of the
    /// cache line size
    pub const fn bytes_required(capacity: usize) -> usize {
        let raw = size_of::<QueueHeader>() + capacity * size_of::<QueueCell>();
        (raw + CACHE_LINE_SIZE - 1) / CACHE_LINE_SIZE * CACHE_LINE_SIZE
    }

    /// Initialise an empty queue in zeroed memory
    ///
    /// # Safety
    /// `ptr` must be 64-byte aligned, exclusively owned by the caller and
    /// valid for `bytes_required(capacity)` bytes.
    pub unsafe fn init(ptr: *mut u8, capacity: usize) -> Self {
        let queue = Self::from_raw(ptr, capacity);
        let header = ptr as *mut QueueHeader;
        (*header).head = AtomicU64::new(0);
        (*header).tail = AtomicU64::new(0);
        (*header).capacity = capacity as u64;
        for i in 0..capacity {
            (*queue.cells.add(i)).sequence.store(i as u64, Ordering::Relaxed);
        }
        queue
    }

    /// View onto an already initialised queue
    ///
    /// # Safety
    /// `ptr` must point to a queue initialised with [`IndexQueue::init`] and
    /// the same capacity, valid for as long as the view is used.
    pub unsafe fn from_raw(ptr: *mut u8, capacity: usize) -> Self {
        Self {
            header: ptr as *const QueueHeader,
            cells: ptr.add(size_of::<QueueHeader>()) as *const QueueCell,
            capacity: capacity as u64,
        }
    }

    fn header(&self) -> &QueueHeader {
        // SAFETY: guaranteed by the constructors
        unsafe { &*self.header }
    }

    fn cell(&self, position: u64) -> &QueueCell {
        // SAFETY: index is reduced modulo the capacity
        unsafe { &*self.cells.add((position % self.capacity) as usize) }
    }

    /// Number of cells
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Push a value; hands it back when the queue is full
    pub fn push(&self, value: u64) -> Result<(), u64> {
        let header = self.header();
        let mut position = header.tail.load(Ordering::Relaxed);
        loop {
            let cell = self.cell(position);
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = sequence as i64 - position as i64;

            if diff == 0 {
                match header.tail.compare_exchange_weak(
                    position,
                    position + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.store(value, Ordering::Relaxed);
                        cell.sequence.store(position + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => position = actual,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                position = header.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop the oldest value
    pub fn pop(&self) -> Option<u64> {
        let header = self.header();
        let mut position = header.head.load(Ordering::Relaxed);
        loop {
            let cell = self.cell(position);
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = sequence as i64 - (position + 1) as i64;

            if diff == 0 {
                match header.head.compare_exchange_weak(
                    position,
                    position + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = cell.value.load(Ordering::Relaxed);
                        cell.sequence
                            .store(position + self.capacity, Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => position = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                position = header.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of queued values
    pub fn len(&self) -> usize {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    /// Whether the queue is (approximately) empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
