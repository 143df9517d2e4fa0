//! Notifier port

use std::fmt;

use log::{debug, warn};

use crate::{
    error::{EaselError, Result},
    memory::current_pid,
};

use super::{service::EventService, EventId};

/// Builder for a [`Notifier`]
pub struct NotifierBuilder<'a> {
    service: &'a EventService,
    default_event_id: EventId,
}

impl<'a> NotifierBuilder<'a> {
    pub(crate) fn new(service: &'a EventService) -> Self {
        Self {
            service,
            default_event_id: EventId::default(),
        }
    }

    /// Id sent by [`Notifier::notify`]
    pub fn default_event_id(mut self, id: EventId) -> Self {
        self.default_event_id = id;
        self
    }

    /// Register the notifier port
    pub fn create(self) -> Result<Notifier> {
        let channel = self.service.channel();
        channel.check_id(self.default_event_id)?;

        let table = channel.notifiers();
        let port_id = channel.next_port_id();
        let port = match table.claim(current_pid(), port_id) {
            Some(port) => port,
            None => {
                channel.reclaim_dead_ports();
                table
                    .claim(current_pid(), port_id)
                    .ok_or_else(|| EaselError::TooManyNotifiers {
                        service: self.service.name().to_string(),
                        max: table.capacity(),
                    })?
            }
        };
        table.activate(port);

        debug!("Notifier {} created on service {}", port_id, self.service.name());

        Ok(Notifier {
            service: self.service.clone(),
            port,
            port_id,
            default_event_id: self.default_event_id,
        })
    }
}

/// Wakes the listeners of an event service
pub struct Notifier {
    service: EventService,
    port: usize,
    port_id: u64,
    default_event_id: EventId,
}

impl Notifier {
    pub fn id(&self) -> u64 {
        self.port_id
    }

    pub fn default_event_id(&self) -> EventId {
        self.default_event_id
    }

    pub fn service(&self) -> &EventService {
        &self.service
    }

    /// Notify with the default event id; returns the number of listeners
    /// reached
    pub fn notify(&self) -> Result<usize> {
        self.notify_with_custom_event_id(self.default_event_id)
    }

    /// Notify with `id`; fails with `InvalidEventId` above the service maximum
    pub fn notify_with_custom_event_id(&self, id: EventId) -> Result<usize> {
        self.service.channel().notify(id)
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let table = self.service.channel().notifiers();
        if !table.deactivate(self.port) {
            warn!("Notifier {} was reclaimed while alive", self.port_id);
            return;
        }
        table.release(self.port);
        debug!("Notifier {} removed", self.port_id);
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("service", self.service.name())
            .field("id", &self.port_id)
            .field("default_event_id", &self.default_event_id)
            .finish()
    }
}
