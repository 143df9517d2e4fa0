//! Publish-subscribe messaging
//!
//! Publishers loan a slot from the service's shared pool, write the payload
//! in place and send it; every subscriber connected at that moment receives
//! a reference to the same slot. Nothing is copied between processes.

pub mod publisher;
pub mod sample;
pub mod service;
pub mod subscriber;

pub use publisher::{Delivery, Publisher, PublisherBuilder};
pub use sample::{Sample, SampleMut, SampleMutUninit};
pub use service::PubSubService;
pub use subscriber::{Subscriber, SubscriberBuilder};
