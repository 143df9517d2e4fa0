//! Event notification
//!
//! Notifiers mark an event id pending for every listener of the service
//! and wake it through a futex; listeners wait without polling.

pub mod channel;
pub mod listener;
pub mod notifier;
pub mod service;

use std::fmt;

pub use channel::{EventChannel, EventLayout};
pub use listener::{Listener, ListenerBuilder};
pub use notifier::{Notifier, NotifierBuilder};
pub use service::EventService;

/// Identifier carried by a notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(usize);

impl EventId {
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub const fn as_value(&self) -> usize {
        self.0
    }
}

impl From<usize> for EventId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}
