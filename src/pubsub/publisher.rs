//! Publisher port

use std::{cell::Cell, fmt};

use log::{debug, warn};

use crate::{
    error::{EaselError, Result},
    memory::current_pid,
    pool::SlotRef,
    service::ZeroCopySend,
    sync::SequenceCounter,
};

use super::{
    sample::{SampleMut, SampleMutUninit},
    service::PubSubService,
};

/// Result of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The sample reached this many subscribers
    Delivered(usize),
    /// No subscriber was connected; the slot went straight back to the pool
    NoSubscribers,
}

impl Delivery {
    /// Number of subscribers that received the sample
    pub fn subscribers(&self) -> usize {
        match self {
            Self::Delivered(n) => *n,
            Self::NoSubscribers => 0,
        }
    }
}

/// Builder for a [`Publisher`]
pub struct PublisherBuilder<'a, P: ?Sized, H> {
    service: &'a PubSubService<P, H>,
    max_loans: usize,
}

impl<'a, P: ?Sized, H> PublisherBuilder<'a, P, H> {
    pub(crate) fn new(service: &'a PubSubService<P, H>) -> Self {
        Self {
            service,
            max_loans: service.descriptor().pubsub().publisher_max_loans as usize,
        }
    }

    /// Samples this publisher may hold unsent at the same time
    pub fn max_loans(mut self, max_loans: usize) -> Self {
        self.max_loans = max_loans;
        self
    }

    /// Register the publisher port
    pub fn create(self) -> Result<Publisher<P, H>> {
        if self.max_loans == 0 {
            return Err(EaselError::invalid_parameter(
                "max_loans",
                "must be greater than zero",
            ));
        }

        let pool = self.service.pool();
        let table = pool.publishers();
        let port_id = pool.next_port_id();

        let port = match table.claim(current_pid(), port_id) {
            Some(port) => port,
            None => {
                let stats = pool.reclaim_dead_ports();
                if stats.publishers > 0 {
                    debug!("Reclaimed {} dead publishers", stats.publishers);
                }
                table
                    .claim(current_pid(), port_id)
                    .ok_or_else(|| EaselError::TooManyPublishers {
                        service: self.service.name().to_string(),
                        max: table.capacity(),
                    })?
            }
        };
        table.activate(port);

        debug!(
            "Publisher {} created on service {}",
            port_id,
            self.service.name()
        );

        Ok(Publisher {
            service: self.service.clone(),
            port,
            port_id,
            sequence: SequenceCounter::new(),
            loans: Cell::new(0),
            max_loans: self.max_loans,
        })
    }
}

/// Sends samples of type `P` with user header `H`
pub struct Publisher<P: ?Sized, H> {
    service: PubSubService<P, H>,
    port: usize,
    port_id: u64,
    sequence: SequenceCounter,
    loans: Cell<usize>,
    max_loans: usize,
}

impl<P: ?Sized, H> Publisher<P, H> {
    /// Id of this publisher, unique within the service
    pub fn id(&self) -> u64 {
        self.port_id
    }

    pub fn max_loans(&self) -> usize {
        self.max_loans
    }

    /// Samples currently loaned and not yet sent
    pub fn loaned(&self) -> usize {
        self.loans.get()
    }

    /// Sequence number of the last sample sent, 0 if none
    pub fn last_sequence(&self) -> u64 {
        self.sequence.last()
    }

    pub fn service(&self) -> &PubSubService<P, H> {
        &self.service
    }

    pub(crate) fn loan_slot(&self) -> Result<SlotRef> {
        if self.loans.get() >= self.max_loans {
            return Err(EaselError::ExceedsMaxLoans {
                max: self.max_loans,
            });
        }

        let pool = self.service.pool();
        let slot = match pool.loan(self.port) {
            Some(slot) => slot,
            None => {
                let stats = pool.reclaim_dead_ports();
                if !stats.is_empty() {
                    debug!("Reclaimed {} loaned slots of dead publishers", stats.slots);
                }
                pool.loan(self.port).ok_or(EaselError::PoolExhausted {
                    capacity: pool.layout().slot_count,
                })?
            }
        };

        self.loans.set(self.loans.get() + 1);
        Ok(slot)
    }

    pub(crate) fn return_slot(&self, slot: SlotRef) {
        self.service.pool().return_loan(self.port, slot);
        self.loans.set(self.loans.get().saturating_sub(1));
    }

    pub(crate) fn send_slot(&self, slot: SlotRef, len: usize) -> Result<Delivery> {
        self.loans.set(self.loans.get().saturating_sub(1));
        let sequence = self.sequence.next();
        let delivered = self
            .service
            .pool()
            .deliver(self.port, slot, sequence, self.port_id, len)?;

        Ok(match delivered {
            0 => Delivery::NoSubscribers,
            n => Delivery::Delivered(n),
        })
    }

    pub(crate) fn header_ptr(&self, slot: SlotRef) -> *mut u8 {
        self.service.pool().slot_data(slot.index as usize)
    }

    pub(crate) fn payload_ptr(&self, slot: SlotRef) -> *mut u8 {
        self.service.pool().payload_ptr(slot.index as usize)
    }

    /// Send an initialised sample
    pub fn send(&self, sample: SampleMut<'_, P, H>) -> Result<Delivery> {
        sample.send()
    }
}

impl<P: ZeroCopySend, H: ZeroCopySend + Default> Publisher<P, H> {
    /// Loan a slot whose payload is still uninitialised
    pub fn loan_uninit(&self) -> Result<SampleMutUninit<'_, P, H>> {
        let slot = self.loan_slot()?;
        // SAFETY: the slot is exclusively loaned and holds a header of `H`
        unsafe { (self.header_ptr(slot) as *mut H).write(H::default()) };
        Ok(SampleMutUninit::new(self, slot, 1))
    }

    /// Loan a slot with a default payload
    pub fn loan(&self) -> Result<SampleMut<'_, P, H>>
    where
        P: Default,
    {
        Ok(self.loan_uninit()?.write_payload(P::default()))
    }

    /// Copy `value` into a slot and send it
    pub fn send_copy(&self, value: P) -> Result<Delivery> {
        self.loan_uninit()?.write_payload(value).send()
    }
}

impl<T: ZeroCopySend, H: ZeroCopySend + Default> Publisher<[T], H> {
    /// Largest slice a sample can hold
    pub fn max_slice_len(&self) -> usize {
        self.service.pool().layout().max_elements
    }

    /// Loan a slot for `len` uninitialised elements
    pub fn loan_slice_uninit(&self, len: usize) -> Result<SampleMutUninit<'_, [T], H>> {
        let max = self.max_slice_len();
        if len > max {
            return Err(EaselError::SliceTooLong { requested: len, max });
        }
        let slot = self.loan_slot()?;
        // SAFETY: the slot is exclusively loaned and holds a header of `H`
        unsafe { (self.header_ptr(slot) as *mut H).write(H::default()) };
        Ok(SampleMutUninit::new(self, slot, len))
    }

    /// Loan a slot for `len` default elements
    pub fn loan_slice(&self, len: usize) -> Result<SampleMut<'_, [T], H>>
    where
        T: Default,
    {
        Ok(self.loan_slice_uninit(len)?.write_from_fn(|_| T::default()))
    }

    /// Copy `values` into a slot and send it
    pub fn send_slice_copy(&self, values: &[T]) -> Result<Delivery>
    where
        T: Copy,
    {
        self.loan_slice_uninit(values.len())?
            .write_from_slice(values)
            .send()
    }
}

impl<P: ?Sized, H> Drop for Publisher<P, H> {
    fn drop(&mut self) {
        let pool = self.service.pool();
        let table = pool.publishers();
        if !table.deactivate(self.port) {
            warn!("Publisher {} was reclaimed while alive", self.port_id);
            return;
        }
        let leaked = pool.drain_publisher(self.port);
        if leaked > 0 {
            warn!("Publisher {} returned {} leaked loans", self.port_id, leaked);
        }
        table.release(self.port);
        debug!("Publisher {} removed", self.port_id);
    }
}

impl<P: ?Sized, H> fmt::Debug for Publisher<P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("service", self.service.name())
            .field("id", &self.port_id)
            .field("loaned", &self.loans.get())
            .field("max_loans", &self.max_loans)
            .finish()
    }
}
