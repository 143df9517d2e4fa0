//! Fixed-capacity sample pool of a publish-subscribe service

pub mod layout;
#[allow(clippy::module_inception)]
pub mod pool;
pub mod slot;

pub use layout::{align_up, PoolLayout};
pub use pool::{ReclaimStats, SamplePool};
pub use slot::{SlotRef, SlotState};
