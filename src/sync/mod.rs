//! Cross-process synchronization primitives
//!
//! Everything here works on memory shared between processes with
//! independent lifetimes, so no primitive relies on a lock that a crashed
//! peer could leave held:
//! - futex wait/wake on a shared 32-bit word for blocking waits
//! - a bounded lock-free queue of slot references for sample delivery
//! - per-publisher sequence numbers for loss detection

pub mod futex;
pub mod queue;
pub mod sequence;

pub use futex::WaitOutcome;
pub use queue::IndexQueue;
pub use sequence::{Observation, SequenceCounter, SequenceNumber, SequenceTracker, FIRST_SEQUENCE};
