//! Port tables in shared memory
//!
//! Every publisher, subscriber, notifier and listener occupies one entry of
//! the matching table in the service segment. Entries record the owning
//! process so that ports of crashed processes can be reclaimed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::memory::is_process_alive;

const FREE: u32 = 0;
const CLAIMING: u32 = 1;
const ACTIVE: u32 = 2;
const RECLAIMING: u32 = 3;

/// One port entry
#[repr(C, align(64))]
pub struct PortEntry {
    state: AtomicU32,
    pid: AtomicU32,
    port_id: AtomicU64,
    /// Publishers: encoded slot reference + 1 of the slot being
    /// distributed, 0 otherwise
    in_flight: AtomicU64,
}

impl PortEntry {
    /// Encoded reference of the slot a publisher is currently distributing
    pub fn in_flight(&self) -> Option<u64> {
        match self.in_flight.load(Ordering::Acquire) {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub fn set_in_flight(&self, slot: Option<u64>) {
        let raw = slot.map(|s| s + 1).unwrap_or(0);
        self.in_flight.store(raw, Ordering::Release);
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn port_id(&self) -> u64 {
        self.port_id.load(Ordering::Acquire)
    }

    /// Only active ports take part in delivery
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Overwrite the recorded owner; lets tests simulate a crashed process
    #[doc(hidden)]
    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }
}

/// View onto a table of port entries
#[derive(Debug, Clone, Copy)]
pub struct PortTable {
    entries: *const PortEntry,
    len: usize,
}

// SAFETY: entries are only touched through atomics
unsafe impl Send for PortTable {}
unsafe impl Sync for PortTable {}

impl PortTable {
    /// Bytes needed for `len` entries
    pub const fn bytes_required(len: usize) -> usize {
        len * std::mem::size_of::<PortEntry>()
    }

    /// # Safety
    /// `ptr` must be 64-byte aligned and valid for `bytes_required(len)`
    /// bytes for as long as the view is used
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            entries: ptr as *const PortEntry,
            len,
        }
    }

    /// Number of entries
    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn entry(&self, index: usize) -> &PortEntry {
        assert!(index < self.len, "port index {} out of range", index);
        // SAFETY: bounds checked above, validity guaranteed by the constructor
        unsafe { &*self.entries.add(index) }
    }

    /// Claim a free entry for `pid`; the caller finishes setting up the
    /// port and then calls [`PortTable::activate`]
    pub fn claim(&self, pid: u32, port_id: u64) -> Option<usize> {
        (0..self.len).find(|&index| {
            let entry = self.entry(index);
            if entry
                .state
                .compare_exchange(FREE, CLAIMING, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return false;
            }
            entry.pid.store(pid, Ordering::Release);
            entry.port_id.store(port_id, Ordering::Release);
            entry.in_flight.store(0, Ordering::Release);
            true
        })
    }

    pub fn activate(&self, index: usize) {
        self.entry(index).state.store(ACTIVE, Ordering::Release);
    }

    /// Stop delivery to an active port before tearing it down
    pub fn deactivate(&self, index: usize) -> bool {
        self.entry(index)
            .state
            .compare_exchange(ACTIVE, RECLAIMING, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self, index: usize) {
        let entry = self.entry(index);
        entry.pid.store(0, Ordering::Release);
        entry.state.store(FREE, Ordering::Release);
    }

    /// Take over an active port whose process is gone; exactly one caller
    /// wins for each dead port
    pub fn claim_dead(&self, index: usize) -> bool {
        let entry = self.entry(index);
        entry.state.load(Ordering::Acquire) == ACTIVE
            && !is_process_alive(entry.pid())
            && self.deactivate(index)
    }

    /// Take a free port for housekeeping without handing it out
    pub fn claim_free(&self, index: usize) -> bool {
        self.entry(index)
            .state
            .compare_exchange(FREE, CLAIMING, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Indices of active ports
    pub fn active(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&index| self.entry(index).is_active())
    }

    /// Number of active ports
    pub fn active_count(&self) -> usize {
        self.active().count()
    }
}
