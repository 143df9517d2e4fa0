//! Loaned and received samples
//!
//! A loaned sample borrows its publisher and is returned to the pool when
//! dropped unsent. A received sample borrows its subscriber and gives up the
//! subscriber's reference on the slot when dropped.

use std::{fmt, mem::MaybeUninit, slice};

use crate::{error::Result, pool::SlotRef, service::ZeroCopySend, sync::SequenceNumber};

use super::{
    publisher::{Delivery, Publisher},
    subscriber::Subscriber,
};

struct Loan<'a, P: ?Sized, H> {
    publisher: &'a Publisher<P, H>,
    slot: SlotRef,
    len: usize,
    pending: bool,
}

impl<P: ?Sized, H> Loan<'_, P, H> {
    fn header(&self) -> *mut H {
        self.publisher.header_ptr(self.slot) as *mut H
    }

    fn payload(&self) -> *mut u8 {
        self.publisher.payload_ptr(self.slot)
    }
}

impl<P: ?Sized, H> Drop for Loan<'_, P, H> {
    fn drop(&mut self) {
        if self.pending {
            self.publisher.return_slot(self.slot);
        }
    }
}

/// Loaned sample whose payload has not been written yet
pub struct SampleMutUninit<'a, P: ?Sized, H> {
    loan: Loan<'a, P, H>,
}

impl<'a, P: ?Sized, H> SampleMutUninit<'a, P, H> {
    pub(crate) fn new(publisher: &'a Publisher<P, H>, slot: SlotRef, len: usize) -> Self {
        Self {
            loan: Loan {
                publisher,
                slot,
                len,
                pending: true,
            },
        }
    }

    /// User header, initialised with its default value at loan time
    pub fn user_header(&self) -> &H {
        // SAFETY: the header was written when the slot was loaned
        unsafe { &*self.loan.header() }
    }

    pub fn user_header_mut(&mut self) -> &mut H {
        // SAFETY: the slot is exclusively loaned
        unsafe { &mut *self.loan.header() }
    }

    /// Treat the payload as initialised
    ///
    /// # Safety
    /// Every byte of the payload must have been written.
    pub unsafe fn assume_init(self) -> SampleMut<'a, P, H> {
        SampleMut { loan: self.loan }
    }
}

impl<'a, P: ZeroCopySend, H> SampleMutUninit<'a, P, H> {
    /// Uninitialised payload
    pub fn payload_mut(&mut self) -> &mut MaybeUninit<P> {
        // SAFETY: the slot is exclusively loaned and sized for `P`
        unsafe { &mut *(self.loan.payload() as *mut MaybeUninit<P>) }
    }

    /// Write the payload
    pub fn write_payload(mut self, value: P) -> SampleMut<'a, P, H> {
        self.payload_mut().write(value);
        // SAFETY: written above
        unsafe { self.assume_init() }
    }
}

impl<'a, T: ZeroCopySend, H> SampleMutUninit<'a, [T], H> {
    /// Uninitialised elements
    pub fn payload_slice_mut(&mut self) -> &mut [MaybeUninit<T>] {
        // SAFETY: the slot holds at least `len` elements and is exclusively
        // loaned
        unsafe {
            slice::from_raw_parts_mut(self.loan.payload() as *mut MaybeUninit<T>, self.loan.len)
        }
    }

    /// Initialise element `i` with `f(i)`
    pub fn write_from_fn<F: FnMut(usize) -> T>(mut self, mut f: F) -> SampleMut<'a, [T], H> {
        for (i, element) in self.payload_slice_mut().iter_mut().enumerate() {
            element.write(f(i));
        }
        // SAFETY: every element written above
        unsafe { self.assume_init() }
    }

    /// Copy `values` into the payload; `values` must match the loaned length
    pub fn write_from_slice(mut self, values: &[T]) -> SampleMut<'a, [T], H>
    where
        T: Copy,
    {
        let elements = self.payload_slice_mut();
        assert_eq!(
            elements.len(),
            values.len(),
            "slice length does not match the loan"
        );
        for (element, value) in elements.iter_mut().zip(values) {
            element.write(*value);
        }
        // SAFETY: every element written above
        unsafe { self.assume_init() }
    }
}

/// Loaned sample with an initialised payload, ready to be sent
pub struct SampleMut<'a, P: ?Sized, H> {
    loan: Loan<'a, P, H>,
}

impl<P: ?Sized, H> SampleMut<'_, P, H> {
    pub fn user_header(&self) -> &H {
        // SAFETY: the header was written when the slot was loaned
        unsafe { &*self.loan.header() }
    }

    pub fn user_header_mut(&mut self) -> &mut H {
        // SAFETY: the slot is exclusively loaned
        unsafe { &mut *self.loan.header() }
    }

    /// Publish the sample to all current subscribers
    pub fn send(mut self) -> Result<Delivery> {
        self.loan.pending = false;
        self.loan.publisher.send_slot(self.loan.slot, self.loan.len)
    }
}

impl<P: ZeroCopySend, H> SampleMut<'_, P, H> {
    pub fn payload(&self) -> &P {
        // SAFETY: initialised and exclusively loaned
        unsafe { &*(self.loan.payload() as *const P) }
    }

    pub fn payload_mut(&mut self) -> &mut P {
        // SAFETY: initialised and exclusively loaned
        unsafe { &mut *(self.loan.payload() as *mut P) }
    }
}

impl<T: ZeroCopySend, H> SampleMut<'_, [T], H> {
    pub fn payload_slice(&self) -> &[T] {
        // SAFETY: `len` initialised elements
        unsafe { slice::from_raw_parts(self.loan.payload() as *const T, self.loan.len) }
    }

    pub fn payload_slice_mut(&mut self) -> &mut [T] {
        // SAFETY: `len` initialised elements, exclusively loaned
        unsafe { slice::from_raw_parts_mut(self.loan.payload() as *mut T, self.loan.len) }
    }
}

impl<P: ?Sized, H> fmt::Debug for SampleMut<'_, P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleMut")
            .field("slot", &self.loan.slot)
            .field("len", &self.loan.len)
            .finish()
    }
}

/// Received sample, read-only
pub struct Sample<'a, P: ?Sized, H> {
    subscriber: &'a Subscriber<P, H>,
    slot: SlotRef,
    sequence: SequenceNumber,
    publisher_id: u64,
    len: usize,
}

impl<'a, P: ?Sized, H> Sample<'a, P, H> {
    pub(crate) fn new(
        subscriber: &'a Subscriber<P, H>,
        slot: SlotRef,
        sequence: SequenceNumber,
        publisher_id: u64,
        len: usize,
    ) -> Self {
        Self {
            subscriber,
            slot,
            sequence,
            publisher_id,
            len,
        }
    }

    /// Sequence number stamped by the publisher
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence
    }

    /// Id of the publisher that sent the sample
    pub fn publisher_id(&self) -> u64 {
        self.publisher_id
    }

    /// Number of payload elements, 1 for single values
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn user_header(&self) -> &H {
        // SAFETY: written by the publisher before publication
        unsafe { &*(self.subscriber.header_ptr(self.slot) as *const H) }
    }
}

impl<P: ZeroCopySend, H> Sample<'_, P, H> {
    pub fn payload(&self) -> &P {
        // SAFETY: type checked at service open, written before publication
        unsafe { &*(self.subscriber.payload_ptr(self.slot) as *const P) }
    }
}

impl<T: ZeroCopySend, H> Sample<'_, [T], H> {
    pub fn payload_slice(&self) -> &[T] {
        // SAFETY: `len` is clamped to the slot capacity by the subscriber
        unsafe {
            slice::from_raw_parts(self.subscriber.payload_ptr(self.slot) as *const T, self.len)
        }
    }
}

impl<P: ?Sized, H> Drop for Sample<'_, P, H> {
    fn drop(&mut self) {
        self.subscriber.release(self.slot);
    }
}

impl<P: ?Sized, H> fmt::Debug for Sample<'_, P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("publisher_id", &self.publisher_id)
            .field("sequence", &self.sequence)
            .field("len", &self.len)
            .finish()
    }
}
