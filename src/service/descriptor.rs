//! Fixed-layout service descriptor stored in the registry

use std::fmt;

use crate::{
    config::{EventDefaults, PublishSubscribeDefaults},
    error::{EaselError, Result},
};

use super::{
    name::{ServiceName, MAX_SERVICE_NAME_LEN},
    types::TypeSignature,
};

/// Messaging pattern of a service
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    PublishSubscribe = 1,
    Event = 2,
}

impl ServiceKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::PublishSubscribe),
            2 => Some(Self::Event),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublishSubscribe => f.write_str("publish-subscribe"),
            Self::Event => f.write_str("event"),
        }
    }
}

/// Capacities of a publish-subscribe service
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubSubSettings {
    /// Number of sample slots in the shared pool
    pub pool_capacity: u64,
    /// Queue depth of every subscriber
    pub subscriber_max_buffer_size: u64,
    pub max_publishers: u64,
    pub max_subscribers: u64,
    /// Samples a single publisher may hold unsent
    pub publisher_max_loans: u64,
    /// Upper bound for slice payloads, 1 for single values
    pub max_slice_len: u64,
}

impl From<&PublishSubscribeDefaults> for PubSubSettings {
    fn from(defaults: &PublishSubscribeDefaults) -> Self {
        Self {
            pool_capacity: defaults.pool_capacity as u64,
            subscriber_max_buffer_size: defaults.subscriber_max_buffer_size as u64,
            max_publishers: defaults.max_publishers as u64,
            max_subscribers: defaults.max_subscribers as u64,
            publisher_max_loans: defaults.publisher_max_loans as u64,
            max_slice_len: defaults.max_slice_len as u64,
        }
    }
}

/// Capacities of an event service
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSettings {
    pub max_notifiers: u64,
    pub max_listeners: u64,
    /// Largest event id a notifier may send
    pub event_id_max_value: u64,
}

impl From<&EventDefaults> for EventSettings {
    fn from(defaults: &EventDefaults) -> Self {
        Self {
            max_notifiers: defaults.max_notifiers as u64,
            max_listeners: defaults.max_listeners as u64,
            event_id_max_value: defaults.event_id_max_value as u64,
        }
    }
}

/// Everything an opener needs to attach to a service, in a layout that is
/// identical in every process
///
/// Only the settings block matching `kind` is meaningful; the other one is
/// zeroed.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ServiceDescriptor {
    kind: u32,
    name_len: u32,
    name: [u8; MAX_SERVICE_NAME_LEN],
    payload: TypeSignature,
    user_header: TypeSignature,
    pubsub: PubSubSettings,
    event: EventSettings,
}

impl ServiceDescriptor {
    /// Descriptor of a publish-subscribe service
    pub fn publish_subscribe(
        name: &ServiceName,
        payload: TypeSignature,
        user_header: TypeSignature,
        settings: PubSubSettings,
    ) -> Self {
        let mut descriptor = Self::empty(name, ServiceKind::PublishSubscribe);
        descriptor.payload = payload;
        descriptor.user_header = user_header;
        descriptor.pubsub = settings;
        descriptor
    }

    /// Descriptor of an event service
    pub fn event(name: &ServiceName, settings: EventSettings) -> Self {
        let mut descriptor = Self::empty(name, ServiceKind::Event);
        descriptor.payload = TypeSignature::of::<()>();
        descriptor.user_header = TypeSignature::of::<()>();
        descriptor.event = settings;
        descriptor
    }

    fn empty(name: &ServiceName, kind: ServiceKind) -> Self {
        let bytes = name.as_str().as_bytes();
        let mut raw_name = [0u8; MAX_SERVICE_NAME_LEN];
        raw_name[..bytes.len()].copy_from_slice(bytes);

        Self {
            kind: kind as u32,
            name_len: bytes.len() as u32,
            name: raw_name,
            payload: TypeSignature::of::<()>(),
            user_header: TypeSignature::of::<()>(),
            pubsub: PubSubSettings {
                pool_capacity: 0,
                subscriber_max_buffer_size: 0,
                max_publishers: 0,
                max_subscribers: 0,
                publisher_max_loans: 0,
                max_slice_len: 0,
            },
            event: EventSettings {
                max_notifiers: 0,
                max_listeners: 0,
                event_id_max_value: 0,
            },
        }
    }

    /// Raw name bytes
    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..(self.name_len as usize).min(MAX_SERVICE_NAME_LEN)]
    }

    /// Service name
    pub fn name(&self) -> &str {
        std::str::from_utf8(self.name_bytes()).unwrap_or("<invalid utf-8>")
    }

    /// Messaging pattern; `None` for a corrupted record
    pub fn kind(&self) -> Option<ServiceKind> {
        ServiceKind::from_raw(self.kind)
    }

    pub fn payload(&self) -> &TypeSignature {
        &self.payload
    }

    pub fn user_header(&self) -> &TypeSignature {
        &self.user_header
    }

    pub fn pubsub(&self) -> &PubSubSettings {
        &self.pubsub
    }

    pub fn event_settings(&self) -> &EventSettings {
        &self.event
    }

    /// Validate capacities and type layouts before the descriptor is
    /// published
    pub fn validate(&self) -> Result<()> {
        match self.kind() {
            Some(ServiceKind::PublishSubscribe) => {
                self.payload.validate()?;
                self.user_header.validate()?;
                let s = &self.pubsub;
                for (parameter, value) in [
                    ("pool_capacity", s.pool_capacity),
                    ("subscriber_max_buffer_size", s.subscriber_max_buffer_size),
                    ("max_publishers", s.max_publishers),
                    ("max_subscribers", s.max_subscribers),
                    ("publisher_max_loans", s.publisher_max_loans),
                    ("max_slice_len", s.max_slice_len),
                ] {
                    if value == 0 {
                        return Err(EaselError::invalid_parameter(
                            parameter,
                            "must be greater than zero",
                        ));
                    }
                }
                if s.max_publishers > u16::MAX as u64 {
                    return Err(EaselError::invalid_parameter(
                        "max_publishers",
                        format!("must not exceed {}", u16::MAX),
                    ));
                }
                if s.pool_capacity > u32::MAX as u64 {
                    return Err(EaselError::invalid_parameter(
                        "pool_capacity",
                        format!("must not exceed {}", u32::MAX),
                    ));
                }
                Ok(())
            }
            Some(ServiceKind::Event) => {
                let s = &self.event;
                if s.max_notifiers == 0 || s.max_listeners == 0 {
                    return Err(EaselError::invalid_parameter(
                        "max_notifiers/max_listeners",
                        "must be greater than zero",
                    ));
                }
                if s.event_id_max_value >= u32::MAX as u64 {
                    return Err(EaselError::invalid_parameter(
                        "event_id_max_value",
                        "is too large",
                    ));
                }
                Ok(())
            }
            None => Err(EaselError::invalid_parameter("kind", "unknown service kind")),
        }
    }

    /// Check that `requested` may attach to the service this descriptor
    /// describes; capacities are not compared
    pub fn check_compatible(&self, requested: &ServiceDescriptor) -> Result<()> {
        if self.kind != requested.kind {
            return Err(EaselError::IncompatibleKind {
                service: self.name().to_string(),
                existing: kind_label(self.kind()),
                requested: kind_label(requested.kind()),
            });
        }

        if let Some(detail) = self.payload.difference(&requested.payload) {
            return Err(EaselError::incompatible_type(
                self.name(),
                format!("payload {}", detail),
            ));
        }

        if let Some(detail) = self.user_header.difference(&requested.user_header) {
            return Err(EaselError::incompatible_type(
                self.name(),
                format!("user header {}", detail),
            ));
        }

        Ok(())
    }
}

fn kind_label(kind: Option<ServiceKind>) -> String {
    kind.map(|k| k.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ServiceDescriptor");
        s.field("name", &self.name()).field("kind", &self.kind());
        match self.kind() {
            Some(ServiceKind::PublishSubscribe) => s
                .field("payload", &self.payload)
                .field("user_header", &self.user_header)
                .field("settings", &self.pubsub),
            _ => s.field("settings", &self.event),
        };
        s.finish()
    }
}
