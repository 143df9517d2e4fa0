//! Opened event service and its port factory

use std::{fmt, sync::Arc};

use crate::{
    error::Result,
    service::{descriptor::ServiceDescriptor, state::SegmentLayout, ServiceName, ServiceState},
};

use super::{
    channel::{EventChannel, EventLayout},
    listener::ListenerBuilder,
    notifier::NotifierBuilder,
};

pub(crate) struct EventSegmentLayout;

impl SegmentLayout for EventSegmentLayout {
    fn segment_size(descriptor: &ServiceDescriptor) -> Result<usize> {
        Ok(EventLayout::new(descriptor)?.total)
    }

    fn init_segment(descriptor: &ServiceDescriptor, data: *mut u8) -> Result<()> {
        let layout = EventLayout::new(descriptor)?;
        // SAFETY: called once by the creator on zeroed memory of
        // `layout.total` bytes
        unsafe { EventChannel::init(data, layout) };
        Ok(())
    }
}

/// An event service: notifiers wake listeners with small integer ids
#[derive(Clone)]
pub struct EventService {
    state: Arc<ServiceState>,
    channel: EventChannel,
}

impl EventService {
    pub(crate) fn new(state: Arc<ServiceState>) -> Result<Self> {
        let layout = EventLayout::new(state.descriptor())?;
        // SAFETY: the segment was sized and initialised for this layout and
        // outlives the view through `state`
        let channel = unsafe { EventChannel::attach(state.data_ptr(), layout)? };
        Ok(Self { state, channel })
    }

    pub(crate) fn channel(&self) -> &EventChannel {
        &self.channel
    }

    pub(crate) fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    pub fn name(&self) -> &ServiceName {
        self.state.name()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.state.descriptor()
    }

    /// Largest valid event id
    pub fn event_id_max_value(&self) -> usize {
        self.channel.layout().event_id_max
    }

    pub fn number_of_notifiers(&self) -> usize {
        self.channel.notifiers().active_count()
    }

    pub fn number_of_listeners(&self) -> usize {
        self.channel.listeners().active_count()
    }

    /// Release ports of processes that died; returns `(notifiers, listeners)`
    pub fn reclaim_dead_ports(&self) -> (usize, usize) {
        self.channel.reclaim_dead_ports()
    }

    pub fn notifier_builder(&self) -> NotifierBuilder<'_> {
        NotifierBuilder::new(self)
    }

    pub fn listener_builder(&self) -> ListenerBuilder<'_> {
        ListenerBuilder::new(self)
    }
}

impl fmt::Debug for EventService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventService")
            .field("name", self.name())
            .field("descriptor", self.descriptor())
            .finish()
    }
}
