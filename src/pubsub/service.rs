//! Opened publish-subscribe service and its port factory

use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{
    error::Result,
    pool::{PoolLayout, ReclaimStats, SamplePool},
    service::{descriptor::ServiceDescriptor, state::SegmentLayout, ServiceName, ServiceState},
};

use super::{publisher::PublisherBuilder, subscriber::SubscriberBuilder};

pub(crate) struct PubSubLayout;

impl SegmentLayout for PubSubLayout {
    fn segment_size(descriptor: &ServiceDescriptor) -> Result<usize> {
        Ok(PoolLayout::new(descriptor)?.total)
    }

    fn init_segment(descriptor: &ServiceDescriptor, data: *mut u8) -> Result<()> {
        let layout = PoolLayout::new(descriptor)?;
        // SAFETY: called once by the creator on zeroed memory of
        // `layout.total` bytes
        unsafe { SamplePool::init(data, layout) };
        Ok(())
    }
}

/// A publish-subscribe service with payload `P` and user header `H`
///
/// `P` is either a [`ZeroCopySend`](crate::service::ZeroCopySend) type or a
/// slice `[T]` of one.
pub struct PubSubService<P: ?Sized, H> {
    state: Arc<ServiceState>,
    pool: SamplePool,
    _types: PhantomData<fn(&P, &H)>,
}

impl<P: ?Sized, H> PubSubService<P, H> {
    pub(crate) fn new(state: Arc<ServiceState>) -> Result<Self> {
        let layout = PoolLayout::new(state.descriptor())?;
        // SAFETY: the segment was sized and initialised for this layout and
        // outlives the view through `state`
        let pool = unsafe { SamplePool::attach(state.data_ptr(), layout)? };
        Ok(Self {
            state,
            pool,
            _types: PhantomData,
        })
    }

    pub(crate) fn pool(&self) -> &SamplePool {
        &self.pool
    }

    pub(crate) fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    /// Name of the service
    pub fn name(&self) -> &ServiceName {
        self.state.name()
    }

    /// Descriptor as published by the creator
    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.state.descriptor()
    }

    /// Number of publishers across all processes
    pub fn number_of_publishers(&self) -> usize {
        self.pool.publishers().active_count()
    }

    /// Number of subscribers across all processes
    pub fn number_of_subscribers(&self) -> usize {
        self.pool.subscribers().active_count()
    }

    /// Number of free sample slots
    pub fn free_slots(&self) -> usize {
        self.pool.free_slots()
    }

    /// Release ports and samples held by processes that died
    pub fn reclaim_dead_ports(&self) -> ReclaimStats {
        self.pool.reclaim_dead_ports()
    }

    /// Builder for a new publisher port
    pub fn publisher_builder(&self) -> PublisherBuilder<'_, P, H> {
        PublisherBuilder::new(self)
    }

    /// Builder for a new subscriber port
    pub fn subscriber_builder(&self) -> SubscriberBuilder<'_, P, H> {
        SubscriberBuilder::new(self)
    }
}

impl<P: ?Sized, H> Clone for PubSubService<P, H> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            pool: self.pool,
            _types: PhantomData,
        }
    }
}

impl<P: ?Sized, H> fmt::Debug for PubSubService<P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubService")
            .field("name", self.name())
            .field("descriptor", self.descriptor())
            .finish()
    }
}
