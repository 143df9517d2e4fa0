//! Service builders

use std::marker::PhantomData;

use crate::{
    error::Result,
    event::{service::EventSegmentLayout, EventService},
    node::Node,
    pubsub::{service::PubSubLayout, PubSubService},
};

use super::{
    descriptor::{EventSettings, PubSubSettings, ServiceDescriptor},
    name::ServiceName,
    registry::OpenMode,
    types::{TypeSignature, ZeroCopySend},
};

/// Entry point for opening or creating a service by name
pub struct ServiceBuilder<'a> {
    node: &'a Node,
    name: ServiceName,
}

impl<'a> ServiceBuilder<'a> {
    pub(crate) fn new(node: &'a Node, name: &ServiceName) -> Self {
        Self {
            node,
            name: name.clone(),
        }
    }

    /// Publish-subscribe service carrying single values of `T`
    pub fn publish_subscribe<T: ZeroCopySend>(self) -> PubSubServiceBuilder<'a, T, ()> {
        let mut settings = PubSubSettings::from(&self.node.config().defaults.publish_subscribe);
        settings.max_slice_len = 1;
        PubSubServiceBuilder::new(self, TypeSignature::of::<T>(), settings)
    }

    /// Publish-subscribe service carrying bounded slices of `T`
    pub fn publish_subscribe_slice<T: ZeroCopySend>(self) -> PubSubServiceBuilder<'a, [T], ()> {
        let settings = PubSubSettings::from(&self.node.config().defaults.publish_subscribe);
        PubSubServiceBuilder::new(self, TypeSignature::slice_of::<T>(), settings)
    }

    /// Event service
    pub fn event(self) -> EventServiceBuilder<'a> {
        let settings = EventSettings::from(&self.node.config().defaults.event);
        EventServiceBuilder {
            node: self.node,
            name: self.name,
            settings,
        }
    }
}

/// Builder for a [`PubSubService`]
///
/// Capacities only apply when the service is created; an opener always
/// gets the creator's values.
pub struct PubSubServiceBuilder<'a, P: ?Sized, H> {
    node: &'a Node,
    name: ServiceName,
    payload: TypeSignature,
    user_header: TypeSignature,
    settings: PubSubSettings,
    _types: PhantomData<fn(&P, &H)>,
}

impl<'a, P: ?Sized> PubSubServiceBuilder<'a, P, ()> {
    fn new(builder: ServiceBuilder<'a>, payload: TypeSignature, settings: PubSubSettings) -> Self {
        Self {
            node: builder.node,
            name: builder.name,
            payload,
            user_header: TypeSignature::of::<()>(),
            settings,
            _types: PhantomData,
        }
    }
}

impl<'a, P: ?Sized, H> PubSubServiceBuilder<'a, P, H> {
    /// Attach a user header of type `U` to every sample
    pub fn user_header<U: ZeroCopySend>(self) -> PubSubServiceBuilder<'a, P, U> {
        PubSubServiceBuilder {
            node: self.node,
            name: self.name,
            payload: self.payload,
            user_header: TypeSignature::of::<U>(),
            settings: self.settings,
            _types: PhantomData,
        }
    }

    pub fn pool_capacity(mut self, value: usize) -> Self {
        self.settings.pool_capacity = value as u64;
        self
    }

    pub fn subscriber_max_buffer_size(mut self, value: usize) -> Self {
        self.settings.subscriber_max_buffer_size = value as u64;
        self
    }

    pub fn max_publishers(mut self, value: usize) -> Self {
        self.settings.max_publishers = value as u64;
        self
    }

    pub fn max_subscribers(mut self, value: usize) -> Self {
        self.settings.max_subscribers = value as u64;
        self
    }

    pub fn publisher_max_loans(mut self, value: usize) -> Self {
        self.settings.publisher_max_loans = value as u64;
        self
    }

    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::publish_subscribe(
            &self.name,
            self.payload,
            self.user_header,
            self.settings,
        )
    }

    fn build(self, mode: OpenMode) -> Result<PubSubService<P, H>> {
        let state = self
            .node
            .open_service::<PubSubLayout>(&self.name, &self.descriptor(), mode)?;
        PubSubService::new(state)
    }

    /// Open an existing service; fails if it does not exist
    pub fn open(self) -> Result<PubSubService<P, H>> {
        self.build(OpenMode::Open)
    }

    /// Create the service; fails if it already exists
    pub fn create(self) -> Result<PubSubService<P, H>> {
        self.build(OpenMode::Create)
    }

    pub fn open_or_create(self) -> Result<PubSubService<P, H>> {
        self.build(OpenMode::OpenOrCreate)
    }
}

impl<T, H> PubSubServiceBuilder<'_, [T], H> {
    /// Largest slice a sample can carry
    pub fn max_slice_len(mut self, value: usize) -> Self {
        self.settings.max_slice_len = value as u64;
        self
    }
}

/// Builder for an [`EventService`]
pub struct EventServiceBuilder<'a> {
    node: &'a Node,
    name: ServiceName,
    settings: EventSettings,
}

impl EventServiceBuilder<'_> {
    pub fn max_notifiers(mut self, value: usize) -> Self {
        self.settings.max_notifiers = value as u64;
        self
    }

    pub fn max_listeners(mut self, value: usize) -> Self {
        self.settings.max_listeners = value as u64;
        self
    }

    /// Largest event id notifiers may send
    pub fn event_id_max_value(mut self, value: usize) -> Self {
        self.settings.event_id_max_value = value as u64;
        self
    }

    fn build(self, mode: OpenMode) -> Result<EventService> {
        let descriptor = ServiceDescriptor::event(&self.name, self.settings);
        let state = self
            .node
            .open_service::<EventSegmentLayout>(&self.name, &descriptor, mode)?;
        EventService::new(state)
    }

    pub fn open(self) -> Result<EventService> {
        self.build(OpenMode::Open)
    }

    pub fn create(self) -> Result<EventService> {
        self.build(OpenMode::Create)
    }

    pub fn open_or_create(self) -> Result<EventService> {
        self.build(OpenMode::OpenOrCreate)
    }
}
