//! Sample slot header and its state word
//!
//! The state word packs `generation << 32 | owner << 8 | state`. The
//! generation is bumped every time a slot returns to the free list, so a
//! queue entry or reclaim decision made against an older generation can be
//! recognised as stale.
//!
//! The reference word packs `generation << 32 | publisher bit | count`. The
//! publisher bit is the reference the sending publisher holds while it
//! distributes the slot; clearing it is a single CAS tagged with the
//! generation, so a reclaimer can finish the job of a publisher that died
//! mid-send without ever dropping a reference twice.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::sync::SequenceNumber;

const PUBLISHER_REF: u64 = 1 << 31;
const COUNT_MASK: u64 = PUBLISHER_REF - 1;

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list
    Free,
    /// Exclusively owned by a publisher that is writing it
    Loaned,
    /// Published; shared read-only by its subscribers
    InFlight,
}

impl SlotState {
    const fn raw(self) -> u64 {
        match self {
            Self::Free => 0,
            Self::Loaned => 1,
            Self::InFlight => 2,
        }
    }
}

/// Decoded slot state word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWord(u64);

impl SlotWord {
    pub const fn new(state: SlotState, owner: u16, generation: u32) -> Self {
        Self(((generation as u64) << 32) | ((owner as u64) << 8) | state.raw())
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn state(self) -> Option<SlotState> {
        match self.0 & 0xff {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Loaned),
            2 => Some(SlotState::InFlight),
            _ => None,
        }
    }

    pub const fn owner(self) -> u16 {
        ((self.0 >> 8) & 0xffff) as u16
    }

    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Reference to one generation of a slot, also the value carried by
/// subscriber queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub index: u32,
    pub generation: u32,
}

impl SlotRef {
    pub const fn encode(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn decode(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// Per-slot bookkeeping in shared memory
#[repr(C, align(64))]
pub struct SlotHeader {
    state: AtomicU64,
    refs: AtomicU64,
    sequence: AtomicU64,
    publisher_id: AtomicU64,
    /// Number of payload elements written
    len: AtomicU64,
}

impl SlotHeader {
    pub fn word(&self) -> SlotWord {
        SlotWord(self.state.load(Ordering::Acquire))
    }

    /// Take the slot off the free list for `owner`
    pub fn try_loan(&self, owner: u16) -> Option<u32> {
        let current = self.word();
        if current.state() != Some(SlotState::Free) {
            return None;
        }
        let loaned = SlotWord::new(SlotState::Loaned, owner, current.generation());
        self.state
            .compare_exchange(
                current.raw(),
                loaned.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| current.generation())
    }

    /// Return an unsent loan, fencing the generation
    pub fn return_loan(&self, owner: u16, generation: u32) -> bool {
        let loaned = SlotWord::new(SlotState::Loaned, owner, generation);
        let free = SlotWord::new(SlotState::Free, 0, generation.wrapping_add(1));
        self.state
            .compare_exchange(loaned.raw(), free.raw(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Stamp metadata and publish the slot with a reference held by the
    /// publisher
    pub fn publish(
        &self,
        owner: u16,
        generation: u32,
        sequence: SequenceNumber,
        publisher_id: u64,
        len: usize,
    ) -> bool {
        self.sequence.store(sequence, Ordering::Relaxed);
        self.publisher_id.store(publisher_id, Ordering::Relaxed);
        self.len.store(len as u64, Ordering::Relaxed);
        self.refs
            .store(((generation as u64) << 32) | PUBLISHER_REF, Ordering::Relaxed);

        let loaned = SlotWord::new(SlotState::Loaned, owner, generation);
        let in_flight = SlotWord::new(SlotState::InFlight, 0, generation);
        self.state
            .compare_exchange(
                loaned.raw(),
                in_flight.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one subscriber reference; the last reference returns the slot
    /// to the free list. Returns true if the slot was freed.
    pub fn release(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & COUNT_MASK > 0, "slot reference count underflow");
        if previous & (PUBLISHER_REF | COUNT_MASK) != 1 {
            return false;
        }
        self.free_if_unreferenced()
    }

    /// Drop the publisher reference of `generation`, if it is still held.
    /// Returns true if the slot was freed.
    pub fn release_publisher(&self, generation: u32) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if (current >> 32) as u32 != generation || current & PUBLISHER_REF == 0 {
                return false;
            }
            match self.refs.compare_exchange(
                current,
                current & !PUBLISHER_REF,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current & COUNT_MASK != 0 {
            return false;
        }
        self.free_if_unreferenced()
    }

    /// Move a published slot without references back to the free list
    ///
    /// Also finishes a release that was interrupted between dropping the
    /// last reference and freeing the slot.
    pub fn free_if_unreferenced(&self) -> bool {
        let current = self.word();
        let refs = self.refs.load(Ordering::Acquire);
        if current.state() != Some(SlotState::InFlight)
            || (refs >> 32) as u32 != current.generation()
            || refs & (PUBLISHER_REF | COUNT_MASK) != 0
        {
            return false;
        }
        let free = SlotWord::new(SlotState::Free, 0, current.generation().wrapping_add(1));
        self.state
            .compare_exchange(current.raw(), free.raw(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Subscriber references, without the publisher's
    pub fn ref_count(&self) -> u32 {
        (self.refs.load(Ordering::Acquire) & COUNT_MASK) as u32
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn publisher_id(&self) -> u64 {
        self.publisher_id.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }
}
