//! Header placed at the start of every shared memory segment

use std::{
    mem::size_of,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use super::liveness::is_process_alive;

/// Magic number to identify easel segments ("EASELSHM")
pub const SEGMENT_MAGIC: u64 = 0x4541_5345_4C53_484D;

/// Layout version of the header and every structure behind it
pub const SEGMENT_VERSION: u32 = 1;

/// Number of pid slots tracked for liveness checks
pub const MAX_ATTACHMENTS: usize = 256;

/// Set in `attach_word` once the segment is being torn down
pub const DESTROYING: u64 = 1 << 63;

/// Cache line size used for aligning shared structures
pub const CACHE_LINE_SIZE: usize = 64;

/// Global header of a segment
///
/// The creator fills every field and stores `magic` last with release
/// ordering; openers must not look at anything else before they have
/// observed the magic with acquire ordering.
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number, zero until initialisation completed
    pub magic: AtomicU64,
    /// Layout version
    pub version: u32,
    /// Size of this header in bytes
    pub header_size: u32,
    /// Size of the user area in bytes
    pub segment_size: u64,
    /// Pid of the process that created the segment
    pub creator_pid: AtomicU32,
    _reserved: u32,
    /// `DESTROYING` flag plus number of live attachments
    pub attach_word: AtomicU64,
    /// Pids of attached processes, 0 for a free entry
    pub attachments: [AtomicU32; MAX_ATTACHMENTS],
}

/// Size of the header including alignment padding
pub const HEADER_SIZE: usize = size_of::<SegmentHeader>();

const _: () = assert!(HEADER_SIZE % CACHE_LINE_SIZE == 0);

/// Outcome of trying to register one more attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Attached; the pid was recorded at the given table index if any
    Attached(Option<usize>),
    /// The segment is being destroyed, open again
    Destroying,
}

impl SegmentHeader {
    /// Initialise a zeroed header in place, everything except `magic`
    pub fn init(&mut self, segment_size: u64, creator_pid: u32) {
        self.version = SEGMENT_VERSION;
        self.header_size = HEADER_SIZE as u32;
        self.segment_size = segment_size;
        self.creator_pid.store(creator_pid, Ordering::Relaxed);
        self.attach_word.store(1, Ordering::Relaxed);
        self.attachments[0].store(creator_pid, Ordering::Relaxed);
    }

    /// Make the header visible to openers
    pub fn publish(&self) {
        self.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// Magic with acquire ordering, 0 while the creator is still busy
    pub fn load_magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }

    /// Number of attachments currently registered
    pub fn attach_count(&self) -> u64 {
        self.attach_word.load(Ordering::Acquire) & !DESTROYING
    }

    /// Whether teardown has started
    pub fn is_destroying(&self) -> bool {
        self.attach_word.load(Ordering::Acquire) & DESTROYING != 0
    }

    /// Register an attachment for `pid`
    pub fn attach(&self, pid: u32) -> AttachOutcome {
        let mut current = self.attach_word.load(Ordering::Acquire);
        loop {
            if current & DESTROYING != 0 {
                return AttachOutcome::Destroying;
            }
            match self.attach_word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        AttachOutcome::Attached(self.record_pid(pid))
    }

    fn record_pid(&self, pid: u32) -> Option<usize> {
        self.attachments.iter().position(|entry| {
            entry
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Drop an attachment; returns true when the caller took the last one
    /// and therefore owns the teardown of the segment
    pub fn detach(&self, pid: u32, index: Option<usize>) -> bool {
        if let Some(index) = index {
            let _ = self.attachments[index].compare_exchange(
                pid,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }

        let mut current = self.attach_word.load(Ordering::Acquire);
        loop {
            let count = current & !DESTROYING;
            if count == 0 || current & DESTROYING != 0 {
                return false;
            }
            let next = if count == 1 { DESTROYING } else { current - 1 };
            match self.attach_word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return count == 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pids currently recorded in the attachment table
    pub fn attached_pids(&self) -> Vec<u32> {
        self.attachments
            .iter()
            .map(|entry| entry.load(Ordering::Acquire))
            .filter(|&pid| pid != 0)
            .collect()
    }

    /// Liveness check over all recorded attachments
    ///
    /// A segment is stale when nobody is attached without teardown having
    /// started, or when every attachment is accounted for in the table and
    /// none of the recorded processes exists any more.
    pub fn is_stale(&self) -> bool {
        let word = self.attach_word.load(Ordering::Acquire);
        if word & DESTROYING != 0 {
            return false;
        }

        let count = word & !DESTROYING;
        if count == 0 {
            return true;
        }

        let pids = self.attached_pids();
        if (pids.len() as u64) < count {
            // some attachments are untracked, cannot prove anything
            return false;
        }

        !pids.iter().any(|&pid| is_process_alive(pid))
    }

    /// Claim a stale segment for teardown; only one caller can win
    pub fn claim_stale(&self) -> bool {
        let word = self.attach_word.load(Ordering::Acquire);
        if word & DESTROYING != 0 {
            return false;
        }
        self.attach_word
            .compare_exchange(word, DESTROYING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::liveness::current_pid;

    fn zeroed_header() -> Box<SegmentHeader> {
        // SAFETY: every field of the header is valid when zeroed
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn test_attach_detach_cycle() {
        let mut header = zeroed_header();
        let pid = current_pid();
        header.init(128, pid);
        header.publish();

        assert_eq!(header.load_magic(), SEGMENT_MAGIC);
        assert_eq!(header.attach_count(), 1);

        let outcome = header.attach(pid);
        assert_eq!(outcome, AttachOutcome::Attached(Some(1)));
        assert_eq!(header.attach_count(), 2);

        assert!(!header.detach(pid, Some(1)));
        assert!(header.detach(pid, Some(0)));
        assert!(header.is_destroying());
        assert_eq!(header.attach(pid), AttachOutcome::Destroying);
    }

    #[test]
    fn test_stale_detection() {
        let mut header = zeroed_header();
        header.init(128, current_pid());
        assert!(!header.is_stale());

        // only a dead process remains attached
        header.attachments[0].store(i32::MAX as u32 - 1, Ordering::Relaxed);
        assert!(header.is_stale());

        // an untracked attachment keeps the segment alive
        header.attach_word.store(2, Ordering::Relaxed);
        assert!(!header.is_stale());

        header.attach_word.store(1, Ordering::Relaxed);
        assert!(header.claim_stale());
        assert!(!header.claim_stale());
        assert!(!header.is_stale());
    }
}
