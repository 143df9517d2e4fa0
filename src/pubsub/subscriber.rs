//! Subscriber port

use std::{cell::RefCell, fmt};

use log::{debug, trace, warn};

use crate::{
    error::{EaselError, Result},
    memory::current_pid,
    pool::SlotRef,
    sync::{Observation, SequenceTracker},
};

use super::{sample::Sample, service::PubSubService};

/// Builder for a [`Subscriber`]
pub struct SubscriberBuilder<'a, P: ?Sized, H> {
    service: &'a PubSubService<P, H>,
}

impl<'a, P: ?Sized, H> SubscriberBuilder<'a, P, H> {
    pub(crate) fn new(service: &'a PubSubService<P, H>) -> Self {
        Self { service }
    }

    /// Register the subscriber port; only samples sent afterwards are
    /// received
    pub fn create(self) -> Result<Subscriber<P, H>> {
        let pool = self.service.pool();
        let table = pool.subscribers();
        let port_id = pool.next_port_id();

        let port = match table.claim(current_pid(), port_id) {
            Some(port) => port,
            None => {
                let stats = pool.reclaim_dead_ports();
                if stats.subscribers > 0 {
                    debug!("Reclaimed {} dead subscribers", stats.subscribers);
                }
                table
                    .claim(current_pid(), port_id)
                    .ok_or_else(|| EaselError::TooManySubscribers {
                        service: self.service.name().to_string(),
                        max: table.capacity(),
                    })?
            }
        };

        // leftovers of a previous owner of this port
        pool.drain_subscriber(port);
        table.activate(port);

        debug!(
            "Subscriber {} created on service {}",
            port_id,
            self.service.name()
        );

        Ok(Subscriber {
            service: self.service.clone(),
            port,
            port_id,
            tracker: RefCell::new(SequenceTracker::new()),
        })
    }
}

/// Receives samples of type `P` with user header `H`
pub struct Subscriber<P: ?Sized, H> {
    service: PubSubService<P, H>,
    port: usize,
    port_id: u64,
    tracker: RefCell<SequenceTracker>,
}

impl<P: ?Sized, H> Subscriber<P, H> {
    /// Id of this subscriber, unique within the service
    pub fn id(&self) -> u64 {
        self.port_id
    }

    pub fn service(&self) -> &PubSubService<P, H> {
        &self.service
    }

    /// Capacity of the receive queue
    pub fn buffer_size(&self) -> usize {
        self.service.pool().layout().queue_capacity
    }

    /// Whether samples are waiting to be received
    pub fn has_samples(&self) -> bool {
        self.service.pool().has_pending(self.port)
    }

    /// Samples detected as lost through sequence gaps
    pub fn missed_samples(&self) -> u64 {
        self.tracker.borrow().missed()
    }

    /// Take the oldest pending sample
    pub fn receive(&self) -> Result<Option<Sample<'_, P, H>>> {
        let pool = self.service.pool();
        let max_elements = pool.layout().max_elements;

        while let Some(slot) = pool.receive(self.port) {
            let (sequence, publisher_id, len) = pool.slot_meta(slot.index as usize);

            let observation = self.tracker.borrow_mut().observe(publisher_id, sequence);
            match observation {
                Observation::Stale => {
                    trace!(
                        "Dropping stale sample {} of publisher {}",
                        sequence,
                        publisher_id
                    );
                    pool.release(self.port, slot);
                }
                Observation::Fresh { missed } => {
                    if missed > 0 {
                        debug!(
                            "Subscriber {} missed {} samples of publisher {}",
                            self.port_id, missed, publisher_id
                        );
                    }
                    if len > max_elements {
                        warn!("Sample {} claims {} elements, clamping", sequence, len);
                    }
                    return Ok(Some(Sample::new(
                        self,
                        slot,
                        sequence,
                        publisher_id,
                        len.min(max_elements),
                    )));
                }
            }
        }

        Ok(None)
    }

    pub(crate) fn release(&self, slot: SlotRef) {
        self.service.pool().release(self.port, slot);
    }

    pub(crate) fn header_ptr(&self, slot: SlotRef) -> *mut u8 {
        self.service.pool().slot_data(slot.index as usize)
    }

    pub(crate) fn payload_ptr(&self, slot: SlotRef) -> *mut u8 {
        self.service.pool().payload_ptr(slot.index as usize)
    }
}

impl<P: ?Sized, H> Drop for Subscriber<P, H> {
    fn drop(&mut self) {
        let pool = self.service.pool();
        let table = pool.subscribers();
        if !table.deactivate(self.port) {
            warn!("Subscriber {} was reclaimed while alive", self.port_id);
            return;
        }
        pool.drain_subscriber(self.port);
        table.release(self.port);
        debug!("Subscriber {} removed", self.port_id);
    }
}

impl<P: ?Sized, H> fmt::Debug for Subscriber<P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("service", self.service.name())
            .field("id", &self.port_id)
            .field("buffer_size", &self.buffer_size())
            .finish()
    }
}
