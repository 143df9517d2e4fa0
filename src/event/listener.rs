//! Listener port

use std::{
    fmt,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    error::{EaselError, Result},
    memory::current_pid,
    sync::futex,
};

use super::{service::EventService, EventId};

/// Builder for a [`Listener`]
pub struct ListenerBuilder<'a> {
    service: &'a EventService,
}

impl<'a> ListenerBuilder<'a> {
    pub(crate) fn new(service: &'a EventService) -> Self {
        Self { service }
    }

    /// Register the listener port; only notifications sent afterwards are
    /// observed
    pub fn create(self) -> Result<Listener> {
        let channel = self.service.channel();
        let table = channel.listeners();
        let port_id = channel.next_port_id();
        let port = match table.claim(current_pid(), port_id) {
            Some(port) => port,
            None => {
                channel.reclaim_dead_ports();
                table
                    .claim(current_pid(), port_id)
                    .ok_or_else(|| EaselError::TooManyListeners {
                        service: self.service.name().to_string(),
                        max: table.capacity(),
                    })?
            }
        };
        channel.clear(port);
        table.activate(port);

        debug!("Listener {} created on service {}", port_id, self.service.name());

        Ok(Listener {
            service: self.service.clone(),
            port,
            port_id,
        })
    }
}

/// Waits for notifications of an event service
///
/// Pending ids form a set: several notifications with the same id before a
/// wait are observed once.
pub struct Listener {
    service: EventService,
    port: usize,
    port_id: u64,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.port_id
    }

    pub fn service(&self) -> &EventService {
        &self.service
    }

    /// Whether ids are pending
    pub fn has_pending(&self) -> bool {
        self.service.channel().has_pending(self.port)
    }

    /// Take one pending id without blocking
    pub fn try_wait_one(&self) -> Result<Option<EventId>> {
        Ok(self.service.channel().take_one(self.port))
    }

    /// Wait up to `timeout` for one id; `None` on timeout or shutdown
    pub fn timed_wait_one(&self, timeout: Duration) -> Result<Option<EventId>> {
        let channel = self.service.channel();
        self.wait_for(deadline_after(timeout), || channel.take_one(self.port))
    }

    /// Wait for one id; `None` only if shutdown was requested
    pub fn blocking_wait_one(&self) -> Result<Option<EventId>> {
        let channel = self.service.channel();
        self.wait_for(None, || channel.take_one(self.port))
    }

    /// Hand every pending id to `callback` without blocking; returns how
    /// many were taken
    pub fn try_wait_all<F: FnMut(EventId)>(&self, callback: F) -> Result<usize> {
        Ok(self.service.channel().take_all(self.port, callback))
    }

    /// Wait up to `timeout` until ids are pending, then take all of them
    pub fn timed_wait_all<F: FnMut(EventId)>(
        &self,
        mut callback: F,
        timeout: Duration,
    ) -> Result<usize> {
        let channel = self.service.channel();
        let taken = self.wait_for(deadline_after(timeout), || {
            let n = channel.take_all(self.port, &mut callback);
            (n > 0).then_some(n)
        })?;
        Ok(taken.unwrap_or(0))
    }

    /// Wait until ids are pending, then take all of them; returns 0 only
    /// if shutdown was requested
    pub fn blocking_wait_all<F: FnMut(EventId)>(&self, mut callback: F) -> Result<usize> {
        let channel = self.service.channel();
        let taken = self.wait_for(None, || {
            let n = channel.take_all(self.port, &mut callback);
            (n > 0).then_some(n)
        })?;
        Ok(taken.unwrap_or(0))
    }

    /// Sleep on the futex word until `poll` yields, the deadline passes or
    /// shutdown is requested
    fn wait_for<R, F: FnMut() -> Option<R>>(
        &self,
        deadline: Option<Instant>,
        mut poll: F,
    ) -> Result<Option<R>> {
        let state = self.service.state();
        let shutdown = state.shutdown();
        let word = self.service.channel().futex(self.port);
        let mut registration = None;

        loop {
            // read before polling so a notification in between changes it
            let observed = word.load(Ordering::Acquire);
            if let Some(result) = poll() {
                return Ok(Some(result));
            }
            if registration.is_none() {
                registration = Some(shutdown.register_sleeper(word));
            }
            if shutdown.is_requested() {
                debug!("Listener {} woken by shutdown request", self.port_id);
                return Ok(None);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }

            futex::wait_until(word, observed, deadline, Some(state.check_interval()))?;
        }
    }
}

/// Deadline `timeout` from now; `None` if it lies beyond what `Instant`
/// can represent
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

impl Drop for Listener {
    fn drop(&mut self) {
        let channel = self.service.channel();
        let table = channel.listeners();
        if !table.deactivate(self.port) {
            warn!("Listener {} was reclaimed while alive", self.port_id);
            return;
        }
        channel.clear(self.port);
        table.release(self.port);
        debug!("Listener {} removed", self.port_id);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("service", self.service.name())
            .field("id", &self.port_id)
            .finish()
    }
}
