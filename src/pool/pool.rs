//! Shared sample pool with reference counted slots
//!
//! A slot is loaned by exactly one publisher, published to every active
//! subscriber and returned to the free list once the last holder released
//! it. Each subscriber owns a bounded queue of slot references and a bitmap
//! of the slots it currently holds; the bitmap lets a dead subscriber's
//! references be dropped without its cooperation.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace, warn};

use crate::{
    error::{EaselError, Result},
    service::port::PortTable,
    sync::{IndexQueue, SequenceNumber},
};

use super::{
    layout::{PoolControl, PoolLayout},
    slot::{SlotHeader, SlotRef, SlotState},
};

/// Attempts to make room in a full subscriber queue before giving up on
/// that subscriber for one send
const MAX_OVERFLOW_ATTEMPTS: usize = 16;

/// Outcome of a reclaim pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub publishers: usize,
    pub subscribers: usize,
    /// Loaned slots of dead publishers put back on the free list
    pub slots: usize,
}

impl ReclaimStats {
    pub fn is_empty(&self) -> bool {
        self.publishers == 0 && self.subscribers == 0
    }
}

/// View onto the pool region of a publish-subscribe segment
#[derive(Debug, Clone, Copy)]
pub struct SamplePool {
    base: *mut u8,
    layout: PoolLayout,
}

// SAFETY: all shared state is accessed through atomics; slot data is only
// written by the loaning publisher and read after publication
unsafe impl Send for SamplePool {}
unsafe impl Sync for SamplePool {}

impl SamplePool {
    /// Initialise the pool in freshly created, zeroed memory
    ///
    /// # Safety
    /// `base` must be 64-byte aligned, exclusively owned by the caller and
    /// valid for `layout.total` bytes.
    pub unsafe fn init(base: *mut u8, layout: PoolLayout) -> Self {
        let control = base as *mut PoolControl;
        (*control).slot_count = layout.slot_count as u64;
        (*control).slot_stride = layout.slot_stride as u64;
        (*control).next_port_id = AtomicU64::new(1);
        (*control).loan_cursor = AtomicU64::new(0);

        for subscriber in 0..layout.max_subscribers {
            IndexQueue::init(
                base.add(layout.queues + subscriber * layout.queue_stride),
                layout.queue_capacity,
            );
        }

        Self { base, layout }
    }

    /// Attach to an initialised pool
    ///
    /// # Safety
    /// `base` must point to a pool initialised with the same layout and stay
    /// valid for as long as the view is used.
    pub unsafe fn attach(base: *mut u8, layout: PoolLayout) -> Result<Self> {
        let control = &*(base as *const PoolControl);
        if control.slot_count != layout.slot_count as u64
            || control.slot_stride != layout.slot_stride as u64
        {
            return Err(EaselError::memory(format!(
                "Pool layout mismatch: {} slots of {} bytes, expected {} of {}",
                control.slot_count, control.slot_stride, layout.slot_count, layout.slot_stride
            )));
        }
        Ok(Self { base, layout })
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    fn control(&self) -> &PoolControl {
        // SAFETY: guaranteed by the constructors
        unsafe { &*(self.base as *const PoolControl) }
    }

    /// Unique id for a new port of this service
    pub fn next_port_id(&self) -> u64 {
        self.control().next_port_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn publishers(&self) -> PortTable {
        // SAFETY: region computed by the layout
        unsafe { PortTable::from_raw(self.base.add(self.layout.publishers), self.layout.max_publishers) }
    }

    pub fn subscribers(&self) -> PortTable {
        // SAFETY: region computed by the layout
        unsafe {
            PortTable::from_raw(self.base.add(self.layout.subscribers), self.layout.max_subscribers)
        }
    }

    fn slot(&self, index: usize) -> &SlotHeader {
        assert!(index < self.layout.slot_count, "slot {} out of range", index);
        // SAFETY: bounds checked above
        unsafe {
            &*(self.base.add(self.layout.slot_headers) as *const SlotHeader).add(index)
        }
    }

    fn held_word(&self, subscriber: usize, slot: usize) -> &AtomicU64 {
        let word = subscriber * self.layout.held_words + slot / 64;
        // SAFETY: subscriber and slot are bounded by the layout
        unsafe { &*(self.base.add(self.layout.held) as *const AtomicU64).add(word) }
    }

    fn queue(&self, subscriber: usize) -> IndexQueue {
        // SAFETY: queues were initialised by the creator
        unsafe {
            IndexQueue::from_raw(
                self.base
                    .add(self.layout.queues + subscriber * self.layout.queue_stride),
                self.layout.queue_capacity,
            )
        }
    }

    /// Start of a slot's user area; the user header sits at offset 0
    pub fn slot_data(&self, index: usize) -> *mut u8 {
        assert!(index < self.layout.slot_count, "slot {} out of range", index);
        // SAFETY: bounds checked above
        unsafe {
            self.base
                .add(self.layout.slot_data + index * self.layout.slot_stride)
        }
    }

    /// Start of a slot's payload
    pub fn payload_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: the payload offset lies within the slot stride
        unsafe { self.slot_data(index).add(self.layout.payload_offset) }
    }

    /// Metadata stamped at publication: sequence, publisher id, length
    pub fn slot_meta(&self, index: usize) -> (SequenceNumber, u64, usize) {
        let slot = self.slot(index);
        (slot.sequence(), slot.publisher_id(), slot.len())
    }

    /// Take a free slot for publisher port `owner`
    pub fn loan(&self, owner: usize) -> Option<SlotRef> {
        let count = self.layout.slot_count;
        let start = self.control().loan_cursor.fetch_add(1, Ordering::Relaxed) as usize;

        (0..count).find_map(|step| {
            let index = (start + step) % count;
            self.slot(index).try_loan(owner as u16).map(|generation| SlotRef {
                index: index as u32,
                generation,
            })
        })
    }

    /// Put an unsent loan back on the free list
    pub fn return_loan(&self, owner: usize, slot: SlotRef) {
        if !self
            .slot(slot.index as usize)
            .return_loan(owner as u16, slot.generation)
        {
            warn!("Slot {} was not loaned by publisher {}", slot.index, owner);
        }
    }

    /// Publish a loaned slot to every active subscriber; returns the number
    /// of subscribers that received it
    pub fn deliver(
        &self,
        owner: usize,
        slot: SlotRef,
        sequence: SequenceNumber,
        publisher_id: u64,
        len: usize,
    ) -> Result<usize> {
        let index = slot.index as usize;
        let header = self.slot(index);
        let publishers = self.publishers();
        let port = publishers.entry(owner);

        port.set_in_flight(Some(slot.encode()));
        if !header.publish(owner as u16, slot.generation, sequence, publisher_id, len) {
            port.set_in_flight(None);
            return Err(EaselError::connection_broken(format!(
                "Slot {} is no longer loaned by publisher {}",
                index, owner
            )));
        }

        let subscribers = self.subscribers();
        let mut delivered = 0;
        for subscriber in subscribers.active() {
            if self.push_to(subscriber, slot) {
                delivered += 1;
            }
        }

        // the marker outlives the reference so a reclaimer can still drop it
        header.release_publisher(slot.generation);
        port.set_in_flight(None);

        trace!(
            "Publisher {} delivered slot {} (seq {}) to {} subscribers",
            publisher_id,
            index,
            sequence,
            delivered
        );
        Ok(delivered)
    }

    fn push_to(&self, subscriber: usize, slot: SlotRef) -> bool {
        let index = slot.index as usize;
        let mask = 1u64 << (index % 64);

        self.slot(index).retain();
        let previous = self.held_word(subscriber, index).fetch_or(mask, Ordering::AcqRel);
        if previous & mask != 0 {
            // already held from a stale entry; keep a single reference
            self.slot(index).release();
        }

        let queue = self.queue(subscriber);
        let mut value = slot.encode();
        for _ in 0..MAX_OVERFLOW_ATTEMPTS {
            match queue.push(value) {
                Ok(()) => return true,
                Err(rejected) => {
                    value = rejected;
                    // full: the oldest undelivered sample makes room
                    if let Some(oldest) = queue.pop() {
                        trace!("Subscriber {} overflowed, dropping oldest sample", subscriber);
                        self.release_entry(subscriber, SlotRef::decode(oldest));
                    }
                }
            }
        }

        warn!("Subscriber {} queue stays full, sample skipped", subscriber);
        self.release_held(subscriber, index);
        false
    }

    /// Pop the next valid entry from a subscriber queue
    pub fn receive(&self, subscriber: usize) -> Option<SlotRef> {
        let queue = self.queue(subscriber);
        while let Some(raw) = queue.pop() {
            let slot = SlotRef::decode(raw);
            if (slot.index as usize) >= self.layout.slot_count {
                warn!("Discarding corrupted queue entry {:#x}", raw);
                continue;
            }
            let word = self.slot(slot.index as usize).word();
            if word.state() == Some(SlotState::InFlight) && word.generation() == slot.generation {
                return Some(slot);
            }
            debug!(
                "Discarding stale queue entry for slot {} (generation {} != {})",
                slot.index,
                slot.generation,
                word.generation()
            );
        }
        None
    }

    /// Whether a subscriber has queued entries
    pub fn has_pending(&self, subscriber: usize) -> bool {
        !self.queue(subscriber).is_empty()
    }

    /// Drop the reference a subscriber holds on a received slot
    pub fn release(&self, subscriber: usize, slot: SlotRef) {
        self.release_held(subscriber, slot.index as usize);
    }

    fn release_entry(&self, subscriber: usize, slot: SlotRef) {
        let index = slot.index as usize;
        if index >= self.layout.slot_count {
            return;
        }
        if self.slot(index).word().generation() == slot.generation {
            self.release_held(subscriber, index);
        }
    }

    fn release_held(&self, subscriber: usize, index: usize) {
        let mask = 1u64 << (index % 64);
        let previous = self
            .held_word(subscriber, index)
            .fetch_and(!mask, Ordering::AcqRel);
        if previous & mask != 0 {
            self.slot(index).release();
        }
    }

    /// Drop every reference held by a subscriber port, queued or received
    pub fn drain_subscriber(&self, subscriber: usize) {
        let queue = self.queue(subscriber);
        while let Some(raw) = queue.pop() {
            self.release_entry(subscriber, SlotRef::decode(raw));
        }

        for word in 0..self.layout.held_words {
            let first = word * 64;
            let bits = self.held_word(subscriber, first).swap(0, Ordering::AcqRel);
            for bit in 0..64 {
                if bits & (1 << bit) != 0 && first + bit < self.layout.slot_count {
                    self.slot(first + bit).release();
                }
            }
        }
    }

    /// Return the loans and the in-flight reference of a publisher port
    pub fn drain_publisher(&self, owner: usize) -> usize {
        let publishers = self.publishers();
        let port = publishers.entry(owner);
        if let Some(raw) = port.in_flight() {
            let slot = SlotRef::decode(raw);
            if (slot.index as usize) < self.layout.slot_count {
                self.slot(slot.index as usize).release_publisher(slot.generation);
            }
            port.set_in_flight(None);
        }

        (0..self.layout.slot_count)
            .filter(|&index| {
                let header = self.slot(index);
                let word = header.word();
                word.state() == Some(SlotState::Loaned)
                    && word.owner() as usize == owner
                    && header.return_loan(owner as u16, word.generation())
            })
            .count()
    }

    /// Free published slots whose last holder died between dropping its
    /// reference and returning the slot
    fn sweep_unreferenced(&self) -> usize {
        (0..self.layout.slot_count)
            .filter(|&index| self.slot(index).free_if_unreferenced())
            .count()
    }

    /// Release the ports and resources of processes that died
    pub fn reclaim_dead_ports(&self) -> ReclaimStats {
        let mut stats = ReclaimStats::default();

        let publishers = self.publishers();
        for index in 0..publishers.capacity() {
            if publishers.claim_dead(index) {
                let pid = publishers.entry(index).pid();
                stats.slots += self.drain_publisher(index);
                publishers.release(index);
                stats.publishers += 1;
                warn!("Reclaimed publisher port {} of dead process {}", index, pid);
            }
        }

        let subscribers = self.subscribers();
        for index in 0..subscribers.capacity() {
            if subscribers.claim_dead(index) {
                let pid = subscribers.entry(index).pid();
                self.drain_subscriber(index);
                subscribers.release(index);
                stats.subscribers += 1;
                warn!("Reclaimed subscriber port {} of dead process {}", index, pid);
            } else if subscribers.claim_free(index) {
                // entries pushed while the port was being torn down
                self.drain_subscriber(index);
                subscribers.release(index);
            }
        }

        if !stats.is_empty() {
            stats.slots += self.sweep_unreferenced();
        }
        stats
    }

    /// Number of slots on the free list
    pub fn free_slots(&self) -> usize {
        (0..self.layout.slot_count)
            .filter(|&index| self.slot(index).word().state() == Some(SlotState::Free))
            .count()
    }

    /// Reference count of a slot, for introspection
    pub fn ref_count(&self, index: usize) -> u32 {
        self.slot(index).ref_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        memory::current_pid,
        service::{
            descriptor::{PubSubSettings, ServiceDescriptor},
            name::ServiceName,
            types::TypeSignature,
        },
    };
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct Backing {
        ptr: *mut u8,
        layout: Layout,
        pool: SamplePool,
    }

    impl Drop for Backing {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn pool(capacity: u64, depth: u64) -> Backing {
        let config = Config::default();
        let settings = PubSubSettings {
            pool_capacity: capacity,
            subscriber_max_buffer_size: depth,
            ..PubSubSettings::from(&config.defaults.publish_subscribe)
        };
        let descriptor = ServiceDescriptor::publish_subscribe(
            &ServiceName::new("pool").unwrap(),
            TypeSignature::of::<u64>(),
            TypeSignature::of::<()>(),
            settings,
        );
        let pool_layout = PoolLayout::new(&descriptor).unwrap();
        let layout = Layout::from_size_align(pool_layout.total, 64).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let pool = unsafe { SamplePool::init(ptr, pool_layout) };
        Backing { ptr, layout, pool }
    }

    fn add_port(table: PortTable, pid: u32, id: u64) -> usize {
        let index = table.claim(pid, id).unwrap();
        table.activate(index);
        index
    }

    #[test]
    fn test_loan_until_exhausted() {
        let backing = pool(3, 2);
        let pool = backing.pool;

        let loans: Vec<_> = (0..3).map(|_| pool.loan(0).unwrap()).collect();
        assert!(pool.loan(0).is_none());
        assert_eq!(pool.free_slots(), 0);

        pool.return_loan(0, loans[1]);
        let again = pool.loan(0).unwrap();
        assert_eq!(again.index, loans[1].index);
        assert_eq!(again.generation, loans[1].generation + 1);
    }

    #[test]
    fn test_refcount_tracks_subscribers() {
        let backing = pool(4, 4);
        let pool = backing.pool;
        let publisher = add_port(pool.publishers(), current_pid(), 1);
        let first = add_port(pool.subscribers(), current_pid(), 2);
        let second = add_port(pool.subscribers(), current_pid(), 3);

        let slot = pool.loan(publisher).unwrap();
        assert_eq!(pool.deliver(publisher, slot, 1, 1, 1).unwrap(), 2);
        assert_eq!(pool.ref_count(slot.index as usize), 2);

        let received = pool.receive(first).unwrap();
        assert_eq!(received, slot);
        pool.release(first, received);
        assert_eq!(pool.ref_count(slot.index as usize), 1);
        assert_eq!(pool.free_slots(), 3);

        let received = pool.receive(second).unwrap();
        pool.release(second, received);
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn test_deliver_without_subscribers_frees_slot() {
        let backing = pool(2, 2);
        let pool = backing.pool;
        let publisher = add_port(pool.publishers(), current_pid(), 1);

        let slot = pool.loan(publisher).unwrap();
        assert_eq!(pool.deliver(publisher, slot, 1, 1, 1).unwrap(), 0);
        assert_eq!(pool.free_slots(), 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let backing = pool(8, 2);
        let pool = backing.pool;
        let publisher = add_port(pool.publishers(), current_pid(), 1);
        let subscriber = add_port(pool.subscribers(), current_pid(), 2);

        for sequence in 1..=3 {
            let slot = pool.loan(publisher).unwrap();
            pool.deliver(publisher, slot, sequence, 1, 1).unwrap();
        }

        // the first sample went back to the pool when the third arrived
        assert_eq!(pool.free_slots(), 6);
        let slot = pool.receive(subscriber).unwrap();
        assert_eq!(pool.slot_meta(slot.index as usize).0, 2);
        pool.release(subscriber, slot);
        let slot = pool.receive(subscriber).unwrap();
        assert_eq!(pool.slot_meta(slot.index as usize).0, 3);
        pool.release(subscriber, slot);
        assert!(pool.receive(subscriber).is_none());
        assert_eq!(pool.free_slots(), 8);
    }

    #[test]
    fn test_reclaim_dead_subscriber() {
        let backing = pool(4, 4);
        let pool = backing.pool;
        let publisher = add_port(pool.publishers(), current_pid(), 1);
        let subscriber = add_port(pool.subscribers(), current_pid(), 2);

        for sequence in 1..=2 {
            let slot = pool.loan(publisher).unwrap();
            pool.deliver(publisher, slot, sequence, 1, 1).unwrap();
        }
        // one received and held, one still queued
        let _held = pool.receive(subscriber).unwrap();
        assert_eq!(pool.free_slots(), 2);

        pool.subscribers().entry(subscriber).set_pid(i32::MAX as u32 - 1);
        let stats = pool.reclaim_dead_ports();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(pool.free_slots(), 4);
        assert_eq!(pool.subscribers().active_count(), 0);
    }

    #[test]
    fn test_publisher_dead_after_delivery_is_reclaimed() {
        let backing = pool(4, 4);
        let pool = backing.pool;
        let publisher = add_port(pool.publishers(), current_pid(), 1);
        let subscriber = add_port(pool.subscribers(), current_pid(), 2);

        // crash right after distribution: reference and marker still held
        let slot = pool.loan(publisher).unwrap();
        let header = pool.slot(slot.index as usize);
        pool.publishers()
            .entry(publisher)
            .set_in_flight(Some(slot.encode()));
        assert!(header.publish(publisher as u16, slot.generation, 1, 1, 1));
        assert!(pool.push_to(subscriber, slot));
        assert_eq!(pool.free_slots(), 3);

        pool.publishers().entry(publisher).set_pid(i32::MAX as u32 - 1);
        let stats = pool.reclaim_dead_ports();
        assert_eq!(stats.publishers, 1);
        assert_eq!(pool.ref_count(slot.index as usize), 1);

        let received = pool.receive(subscriber).unwrap();
        pool.release(subscriber, received);
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn test_publisher_dead_after_releasing_reference() {
        let backing = pool(4, 4);
        let pool = backing.pool;
        let publisher = add_port(pool.publishers(), current_pid(), 1);
        let subscriber = add_port(pool.subscribers(), current_pid(), 2);

        // crash between dropping the reference and clearing the marker
        let slot = pool.loan(publisher).unwrap();
        let header = pool.slot(slot.index as usize);
        pool.publishers()
            .entry(publisher)
            .set_in_flight(Some(slot.encode()));
        assert!(header.publish(publisher as u16, slot.generation, 1, 1, 1));
        assert!(pool.push_to(subscriber, slot));
        header.release_publisher(slot.generation);

        pool.publishers().entry(publisher).set_pid(i32::MAX as u32 - 1);
        pool.reclaim_dead_ports();
        // the subscriber's reference is untouched
        assert_eq!(pool.ref_count(slot.index as usize), 1);
        assert_eq!(pool.free_slots(), 3);

        let received = pool.receive(subscriber).unwrap();
        pool.release(subscriber, received);
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn test_reclaim_dead_publisher_fences_loans() {
        let backing = pool(4, 4);
        let pool = backing.pool;
        let publisher = add_port(pool.publishers(), current_pid(), 1);

        let loaned = pool.loan(publisher).unwrap();
        pool.loan(publisher).unwrap();
        assert_eq!(pool.free_slots(), 2);

        pool.publishers().entry(publisher).set_pid(i32::MAX as u32 - 1);
        let stats = pool.reclaim_dead_ports();
        assert_eq!(stats.publishers, 1);
        assert_eq!(stats.slots, 2);
        assert_eq!(pool.free_slots(), 4);

        // a late send of the fenced loan is refused
        assert!(matches!(
            pool.deliver(publisher, loaned, 1, 1, 1),
            Err(EaselError::ConnectionBroken { .. })
        ));
    }
}
