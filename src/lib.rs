//! # Easel - Zero-Copy Inter-Process Messaging
//!
//! Easel moves data between processes on the same host without copying
//! it. Publishers write samples directly into a shared memory pool,
//! subscribers read the very same bytes, and event listeners sleep on
//! futexes until a notifier wakes them.
//!
//! ## Features
//!
//! - **Publish-subscribe**: typed samples and bounded slices, optional user
//!   header, lossy bounded queues per subscriber
//! - **Events**: small integer ids delivered to every listener, no polling
//! - **Shared registry**: services are found by name across processes,
//!   with type and pattern checks before any data is touched
//! - **Crash tolerance**: segments and ports of dead processes are detected
//!   and reclaimed
//! - **Clean shutdown**: signal handling that interrupts blocking waits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                     Node                        │
//! │   config · signal handling · service handles    │
//! ├─────────────────────────────────────────────────┤
//! │  Registry segment      │  Service data segments │
//! │  - name → descriptor   │  - port tables         │
//! │  - open counts         │  - sample pool/queues  │
//! │                        │  - event bitmaps       │
//! └─────────────────────────────────────────────────┘
//!           │                         │
//!           ▼                         ▼
//! ┌─────────────────┐    ┌─────────────────────────┐
//! │ Publisher /     │    │ Notifier /              │
//! │ Subscriber      │    │ Listener                │
//! └─────────────────┘    └─────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use easel::prelude::*;
//!
//! # fn main() -> easel::Result<()> {
//! let node = NodeBuilder::new().create()?;
//! let service = node
//!     .service_builder(&ServiceName::new("My/Funk/ServiceName")?)
//!     .publish_subscribe::<u64>()
//!     .open_or_create()?;
//!
//! let publisher = service.publisher_builder().create()?;
//! let subscriber = service.subscriber_builder().create()?;
//!
//! publisher.send_copy(1234)?;
//! if let Some(sample) = subscriber.receive()? {
//!     assert_eq!(*sample.payload(), 1234);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod node;
pub mod pool;
pub mod pubsub;
pub mod service;
pub mod sync;

// Main API re-exports
pub use config::{Config, RecoveryPolicy};
pub use error::{EaselError, ErrorKind, Result};
pub use event::{EventId, EventService, Listener, Notifier};
pub use node::{Node, NodeBuilder};
pub use pubsub::{Delivery, PubSubService, Publisher, Sample, SampleMut, SampleMutUninit, Subscriber};
pub use service::{ServiceDescriptor, ServiceKind, ServiceName, ZeroCopySend};

/// Everything needed for typical use
pub mod prelude {
    pub use crate::{
        Config, Delivery, EaselError, EventId, Node, NodeBuilder, ServiceName, ZeroCopySend,
    };
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
