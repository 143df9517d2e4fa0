//! Per-publisher sequence numbers and gap detection
//!
//! Every publisher stamps its samples with a strictly increasing sequence
//! starting at [`FIRST_SEQUENCE`]. Subscribers use the numbers only to
//! detect loss and to reject anything not newer than what they have seen;
//! they never order samples of different publishers by them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sequence number type for strong typing
pub type SequenceNumber = u64;

/// Sequence number of the first sample of every publisher
pub const FIRST_SEQUENCE: SequenceNumber = 1;

/// Monotonic sequence counter owned by a single publisher
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    /// Create a counter whose first value is [`FIRST_SEQUENCE`]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(FIRST_SEQUENCE),
        }
    }

    /// Take the next sequence number
    pub fn next(&self) -> SequenceNumber {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Last number handed out, 0 if none yet
    pub fn last(&self) -> SequenceNumber {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of observing a sequence number from a publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Newer than everything seen so far; `missed` samples were skipped
    Fresh { missed: u64 },
    /// Not newer than the last seen number, must be discarded
    Stale,
}

/// Last-seen sequence per publisher, kept by a subscriber
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seen: HashMap<u64, SequenceNumber>,
    missed: u64,
}

impl SequenceTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sequence` from `publisher_id`
    ///
    /// The first sample of an unknown publisher counts as fresh without
    /// gaps, since a subscriber connecting late must not report the samples
    /// sent before it existed as lost.
    pub fn observe(&mut self, publisher_id: u64, sequence: SequenceNumber) -> Observation {
        match self.last_seen.get_mut(&publisher_id) {
            None => {
                self.last_seen.insert(publisher_id, sequence);
                Observation::Fresh { missed: 0 }
            }
            Some(last) if sequence <= *last => Observation::Stale,
            Some(last) => {
                let missed = sequence - *last - 1;
                *last = sequence;
                self.missed += missed;
                Observation::Fresh { missed }
            }
        }
    }

    /// Last seen sequence of a publisher
    pub fn last_seen(&self, publisher_id: u64) -> Option<SequenceNumber> {
        self.last_seen.get(&publisher_id).copied()
    }

    /// Total number of samples detected as lost
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Forget a publisher that disconnected
    pub fn forget(&mut self, publisher_id: u64) {
        self.last_seen.remove(&publisher_id);
    }
}
