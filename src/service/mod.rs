//! Services: named, typed rendezvous points between processes
//!
//! A service is identified by its name and messaging pattern. Its
//! descriptor lives in the shared registry; its ports and data live in a
//! data segment sized from that descriptor.

pub mod builder;
pub mod descriptor;
pub mod name;
pub mod port;
pub mod registry;
pub mod state;
pub mod types;

pub use builder::{EventServiceBuilder, PubSubServiceBuilder, ServiceBuilder};
pub use descriptor::{EventSettings, PubSubSettings, ServiceDescriptor, ServiceKind};
pub use name::{ServiceName, MAX_SERVICE_NAME_LEN};
pub use registry::{OpenMode, Registry};
pub use state::ServiceState;
pub use types::{TypeSignature, TypeVariant, ZeroCopySend};
