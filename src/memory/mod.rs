//! Shared memory segment management
//!
//! Every structure of the middleware lives in a named, file-backed segment.
//! A segment starts with a [`SegmentHeader`] carrying magic, version and
//! size, followed by an attachment table that is used both for reference
//! counting across processes and for the liveness check that decides
//! whether a segment left behind by crashed processes may be reclaimed.

pub mod config;
pub mod header;
pub mod liveness;
pub mod segment;

pub use config::SegmentConfig;
pub use header::{SegmentHeader, CACHE_LINE_SIZE, HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION};
pub use liveness::{current_pid, is_process_alive};
pub use segment::SharedSegment;
