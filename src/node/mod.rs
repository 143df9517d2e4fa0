//! Node: the per-process entry point
//!
//! A node owns the configuration, the registry handle and shutdown state of
//! a process (or a part of one). It keeps every service it opened alive
//! until it is dropped.

pub mod signal;

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::{
    config::Config,
    error::{EaselError, Result},
    service::{
        descriptor::ServiceDescriptor,
        registry::{OpenMode, Registry},
        state::{OpenContext, SegmentLayout},
        ServiceBuilder, ServiceName, ServiceState,
    },
};

pub use signal::ShutdownHandle;

/// Builder for a [`Node`]
#[derive(Debug, Default)]
pub struct NodeBuilder {
    config: Option<Config>,
    name: Option<String>,
    signal_handling: Option<bool>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration to use instead of the defaults
    pub fn config(mut self, config: &Config) -> Self {
        self.config = Some(config.clone());
        self
    }

    /// Human readable name, used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether to install handlers for the configured shutdown signals
    /// (default: true)
    pub fn signal_handling(mut self, enabled: bool) -> Self {
        self.signal_handling = Some(enabled);
        self
    }

    pub fn create(self) -> Result<Node> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if self.signal_handling.unwrap_or(true) {
            signal::install_handlers(&config.node.signals()?)?;
        }

        std::fs::create_dir_all(&config.global.root_dir)
            .map_err(|e| EaselError::from_io(e, "Failed to create root directory"))?;

        let registry = Arc::new(Registry::open(&config)?);
        let name = self
            .name
            .unwrap_or_else(|| format!("node-{}", std::process::id()));

        info!("Node {} started at {:?}", name, config.global.root_dir);

        Ok(Node {
            name,
            config,
            registry,
            shutdown: Arc::new(ShutdownHandle::new()),
            services: Mutex::new(Vec::new()),
        })
    }
}

/// Per-process handle to the middleware
pub struct Node {
    name: String,
    config: Config,
    registry: Arc<Registry>,
    shutdown: Arc<ShutdownHandle>,
    services: Mutex<Vec<Arc<ServiceState>>>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start opening or creating the service `name`
    pub fn service_builder(&self, name: &ServiceName) -> ServiceBuilder<'_> {
        ServiceBuilder::new(self, name)
    }

    /// Whether a live service of that name exists
    pub fn service_exists(&self, name: &ServiceName) -> Result<bool> {
        Ok(self.registry.find(name)?.is_some())
    }

    /// Descriptor of a live service
    pub fn service_details(&self, name: &ServiceName) -> Result<Option<ServiceDescriptor>> {
        self.registry.find(name)
    }

    /// Descriptors of all live services
    pub fn list_services(&self) -> Result<Vec<ServiceDescriptor>> {
        self.registry.list()
    }

    /// Number of services this node keeps open
    pub fn open_services(&self) -> usize {
        self.services.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sleep for `cycle_time` unless shutdown is requested
    ///
    /// Returns `Err(Terminated)` once a shutdown signal arrived or
    /// [`Node::request_shutdown`] was called. A zero cycle time only checks.
    pub fn wait(&self, cycle_time: Duration) -> Result<()> {
        // too far out to represent: sleep until shutdown
        let deadline = Instant::now().checked_add(cycle_time);
        loop {
            let token = self.shutdown.wake_token();
            if self.shutdown.is_requested() {
                return Err(EaselError::Terminated);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(());
            }
            self.shutdown.sleep(token, deadline)?;
        }
    }

    /// Ask this node to shut down; wakes its blocking waits
    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    pub(crate) fn open_service<L: SegmentLayout>(
        &self,
        name: &ServiceName,
        requested: &ServiceDescriptor,
        mode: OpenMode,
    ) -> Result<Arc<ServiceState>> {
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = services.iter().find(|s| s.name() == name) {
            if mode == OpenMode::Create {
                return Err(EaselError::ServiceAlreadyExists {
                    service: name.to_string(),
                });
            }
            existing.descriptor().check_compatible(requested)?;
            return Ok(existing.clone());
        }

        let ctx = OpenContext {
            config: &self.config,
            registry: &self.registry,
            shutdown: &self.shutdown,
        };
        let state = ServiceState::open::<L>(&ctx, name, requested, mode)?;
        services.push(state.clone());
        Ok(state)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let services = std::mem::take(
            &mut *self.services.lock().unwrap_or_else(|e| e.into_inner()),
        );
        debug!("Node {} releasing {} services", self.name, services.len());
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("root_dir", &self.config.global.root_dir)
            .field("open_services", &self.open_services())
            .finish()
    }
}
