//! Layout of a publish-subscribe segment
//!
//! ```text
//! +----------------+  0
//! | PoolControl    |
//! +----------------+  publishers
//! | PortEntry * P  |
//! +----------------+  subscribers
//! | PortEntry * S  |
//! +----------------+  held
//! | bitmap * S     |  one bit per slot and subscriber
//! +----------------+  queues
//! | IndexQueue * S |
//! +----------------+  slot_headers
//! | SlotHeader * N |
//! +----------------+  slot_data
//! | slot * N       |  user header, then payload
//! +----------------+  total
//! ```
//!
//! Every region starts on a cache line boundary.

use std::mem::size_of;

use crate::{
    error::{EaselError, Result},
    memory::CACHE_LINE_SIZE,
    service::{descriptor::ServiceDescriptor, port::PortTable},
    sync::IndexQueue,
};

use super::slot::SlotHeader;

/// Round `value` up to the next multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Fixed control block at the start of the segment
#[repr(C, align(64))]
pub struct PoolControl {
    pub slot_count: u64,
    pub slot_stride: u64,
    pub next_port_id: std::sync::atomic::AtomicU64,
    pub loan_cursor: std::sync::atomic::AtomicU64,
}

/// Offsets and sizes derived from a service descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub slot_count: usize,
    pub queue_capacity: usize,
    pub max_publishers: usize,
    pub max_subscribers: usize,
    /// 64-bit words of the held bitmap of one subscriber
    pub held_words: usize,
    /// Offset of the payload inside a slot; the user header sits at 0
    pub payload_offset: usize,
    /// Size of one payload element
    pub element_size: usize,
    pub max_elements: usize,
    pub slot_stride: usize,

    pub publishers: usize,
    pub subscribers: usize,
    pub held: usize,
    pub queues: usize,
    pub queue_stride: usize,
    pub slot_headers: usize,
    pub slot_data: usize,
    pub total: usize,
}

impl PoolLayout {
    /// Compute the layout of a publish-subscribe service
    pub fn new(descriptor: &ServiceDescriptor) -> Result<Self> {
        descriptor.validate()?;

        let settings = descriptor.pubsub();
        let payload = descriptor.payload();
        let header = descriptor.user_header();

        let slot_count = settings.pool_capacity as usize;
        let queue_capacity = settings.subscriber_max_buffer_size as usize;
        let max_publishers = settings.max_publishers as usize;
        let max_subscribers = settings.max_subscribers as usize;
        let max_elements = settings.max_slice_len as usize;

        let payload_offset = align_up(header.size(), payload.align().max(1));
        let payload_bytes = payload
            .size()
            .checked_mul(max_elements)
            .ok_or_else(|| EaselError::invalid_parameter("max_slice_len", "payload size overflows"))?;
        let slot_stride = align_up((payload_offset + payload_bytes).max(1), CACHE_LINE_SIZE);

        let held_words = (slot_count + 63) / 64;
        let queue_stride = IndexQueue::bytes_required(queue_capacity);

        let publishers = align_up(size_of::<PoolControl>(), CACHE_LINE_SIZE);
        let subscribers = publishers + PortTable::bytes_required(max_publishers);
        let held = subscribers + PortTable::bytes_required(max_subscribers);
        let queues = align_up(held + max_subscribers * held_words * 8, CACHE_LINE_SIZE);
        let slot_headers = queues + max_subscribers * queue_stride;
        let slot_data = slot_headers + slot_count * size_of::<SlotHeader>();
        let total = slot_count
            .checked_mul(slot_stride)
            .and_then(|bytes| bytes.checked_add(slot_data))
            .ok_or_else(|| EaselError::invalid_parameter("pool_capacity", "pool size overflows"))?;

        Ok(Self {
            slot_count,
            queue_capacity,
            max_publishers,
            max_subscribers,
            held_words,
            payload_offset,
            element_size: payload.size(),
            max_elements,
            slot_stride,
            publishers,
            subscribers,
            held,
            queues,
            queue_stride,
            slot_headers,
            slot_data,
            total,
        })
    }
}
