//! Shared state of one opened service

use std::{sync::Arc, time::Duration};

use log::{debug, info};

use crate::{
    config::Config,
    error::Result,
    memory::{SegmentConfig, SharedSegment},
    node::signal::ShutdownHandle,
};

use super::{
    descriptor::{ServiceDescriptor, ServiceKind},
    name::ServiceName,
    registry::{OpenMode, Registry, RegistryLease},
};

/// Registry lease plus data segment of a service
///
/// Dropping the last reference detaches from the data segment and then
/// gives up the registry lease, in that order.
#[derive(Debug)]
pub struct ServiceState {
    name: ServiceName,
    lease: RegistryLease,
    registry: Arc<Registry>,
    segment: Option<SharedSegment>,
    shutdown: Arc<ShutdownHandle>,
    check_interval: Duration,
}

/// What a messaging pattern needs to place its data segment
pub(crate) trait SegmentLayout {
    /// Size of the data segment for the creator's descriptor
    fn segment_size(descriptor: &ServiceDescriptor) -> Result<usize>;

    /// Initialise freshly created, zeroed segment memory
    fn init_segment(descriptor: &ServiceDescriptor, data: *mut u8) -> Result<()>;
}

/// Node resources a service is opened with
pub(crate) struct OpenContext<'a> {
    pub config: &'a Config,
    pub registry: &'a Arc<Registry>,
    pub shutdown: &'a Arc<ShutdownHandle>,
}

impl ServiceState {
    pub(crate) fn open<L: SegmentLayout>(
        ctx: &OpenContext<'_>,
        name: &ServiceName,
        requested: &ServiceDescriptor,
        mode: OpenMode,
    ) -> Result<Arc<Self>> {
        requested.validate()?;
        let lease = ctx.registry.open_or_create(name, requested, mode)?;

        let attached = L::segment_size(&lease.descriptor).and_then(|size| {
            let segment_config = SegmentConfig::new(
                Registry::data_segment_name(name, &lease),
                size,
                ctx.config,
            );
            SharedSegment::open_or_create_with(&segment_config, |data| {
                L::init_segment(&lease.descriptor, data)
            })
        });

        let segment = match attached {
            Ok(segment) => segment,
            Err(e) => {
                ctx.registry.release(&lease);
                return Err(e);
            }
        };

        if lease.created {
            info!("Created {} service {}", kind_name(&lease.descriptor), name);
        } else {
            debug!("Opened {} service {}", kind_name(&lease.descriptor), name);
        }

        Ok(Arc::new(Self {
            name: name.clone(),
            lease,
            registry: ctx.registry.clone(),
            segment: Some(segment),
            shutdown: ctx.shutdown.clone(),
            check_interval: ctx.config.node.shutdown_check_interval,
        }))
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    /// Descriptor published by the creator
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.lease.descriptor
    }

    /// Whether this process published the descriptor
    pub fn is_creator(&self) -> bool {
        self.lease.created
    }

    pub fn data_ptr(&self) -> *mut u8 {
        self.segment
            .as_ref()
            .map(|segment| segment.data_ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    pub fn segment(&self) -> Option<&SharedSegment> {
        self.segment.as_ref()
    }

    pub(crate) fn shutdown(&self) -> &ShutdownHandle {
        &self.shutdown
    }

    pub(crate) fn check_interval(&self) -> Duration {
        self.check_interval
    }
}

impl Drop for ServiceState {
    fn drop(&mut self) {
        drop(self.segment.take());
        if self.registry.release(&self.lease) {
            debug!("Service {} has no users left", self.name);
        }
    }
}

fn kind_name(descriptor: &ServiceDescriptor) -> &'static str {
    match descriptor.kind() {
        Some(ServiceKind::PublishSubscribe) => "publish-subscribe",
        Some(ServiceKind::Event) => "event",
        None => "unknown",
    }
}
