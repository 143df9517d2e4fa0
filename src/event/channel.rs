//! Shared layout of an event service
//!
//! ```text
//! | EventControl | notifier ports | listener ports | futex words | pending bitmaps |
//! ```
//!
//! Each listener owns a futex word on its own cache line and a pending
//! bitmap with one bit per event id. Notifying sets the bit and bumps the
//! futex word, so a listener that checked its bitmap before the bit was set
//! still sees the futex change and does not sleep.

use std::{
    mem::size_of,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use log::{trace, warn};

use crate::{
    error::{EaselError, Result},
    memory::CACHE_LINE_SIZE,
    pool::align_up,
    service::{descriptor::ServiceDescriptor, port::PortTable},
    sync::futex,
};

use super::EventId;

#[repr(C, align(64))]
struct EventControl {
    event_id_max: u64,
    max_listeners: u64,
    next_port_id: AtomicU64,
}

#[repr(C, align(64))]
struct ListenerSignal {
    futex: AtomicU32,
}

/// Offsets derived from an event service descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLayout {
    pub event_id_max: usize,
    pub max_notifiers: usize,
    pub max_listeners: usize,
    /// 64-bit words of one pending bitmap
    pub bitmap_words: usize,
    pub notifiers: usize,
    pub listeners: usize,
    pub signals: usize,
    pub bitmaps: usize,
    pub total: usize,
}

impl EventLayout {
    pub fn new(descriptor: &ServiceDescriptor) -> Result<Self> {
        descriptor.validate()?;
        let settings = descriptor.event_settings();

        let event_id_max = settings.event_id_max_value as usize;
        let max_notifiers = settings.max_notifiers as usize;
        let max_listeners = settings.max_listeners as usize;
        let bitmap_words = (event_id_max + 1 + 63) / 64;

        let notifiers = align_up(size_of::<EventControl>(), CACHE_LINE_SIZE);
        let listeners = notifiers + PortTable::bytes_required(max_notifiers);
        let signals = listeners + PortTable::bytes_required(max_listeners);
        let bitmaps = signals + max_listeners * size_of::<ListenerSignal>();
        let total = align_up(bitmaps + max_listeners * bitmap_words * 8, CACHE_LINE_SIZE);

        Ok(Self {
            event_id_max,
            max_notifiers,
            max_listeners,
            bitmap_words,
            notifiers,
            listeners,
            signals,
            bitmaps,
            total,
        })
    }
}

/// View onto the shared state of an event service
#[derive(Debug, Clone, Copy)]
pub struct EventChannel {
    base: *mut u8,
    layout: EventLayout,
}

// SAFETY: all shared state is accessed through atomics
unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl EventChannel {
    /// # Safety
    /// `base` must be 64-byte aligned, zeroed, exclusively owned and valid
    /// for `layout.total` bytes.
    pub unsafe fn init(base: *mut u8, layout: EventLayout) -> Self {
        let control = base as *mut EventControl;
        (*control).event_id_max = layout.event_id_max as u64;
        (*control).max_listeners = layout.max_listeners as u64;
        (*control).next_port_id = AtomicU64::new(1);
        Self { base, layout }
    }

    /// # Safety
    /// `base` must point to a channel initialised with the same layout and
    /// stay valid for as long as the view is used.
    pub unsafe fn attach(base: *mut u8, layout: EventLayout) -> Result<Self> {
        let control = &*(base as *const EventControl);
        if control.event_id_max != layout.event_id_max as u64
            || control.max_listeners != layout.max_listeners as u64
        {
            return Err(EaselError::memory(format!(
                "Event layout mismatch: max id {} with {} listeners, expected {} with {}",
                control.event_id_max,
                control.max_listeners,
                layout.event_id_max,
                layout.max_listeners
            )));
        }
        Ok(Self { base, layout })
    }

    pub fn layout(&self) -> &EventLayout {
        &self.layout
    }

    fn control(&self) -> &EventControl {
        // SAFETY: guaranteed by the constructors
        unsafe { &*(self.base as *const EventControl) }
    }

    pub fn next_port_id(&self) -> u64 {
        self.control().next_port_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn notifiers(&self) -> PortTable {
        // SAFETY: region computed by the layout
        unsafe { PortTable::from_raw(self.base.add(self.layout.notifiers), self.layout.max_notifiers) }
    }

    pub fn listeners(&self) -> PortTable {
        // SAFETY: region computed by the layout
        unsafe { PortTable::from_raw(self.base.add(self.layout.listeners), self.layout.max_listeners) }
    }

    /// Futex word a listener sleeps on
    pub fn futex(&self, listener: usize) -> &AtomicU32 {
        assert!(listener < self.layout.max_listeners);
        // SAFETY: bounds checked above
        unsafe {
            &(*(self.base.add(self.layout.signals) as *const ListenerSignal).add(listener)).futex
        }
    }

    fn bitmap(&self, listener: usize) -> &[AtomicU64] {
        assert!(listener < self.layout.max_listeners);
        // SAFETY: bounds checked above
        unsafe {
            std::slice::from_raw_parts(
                (self.base.add(self.layout.bitmaps) as *const AtomicU64)
                    .add(listener * self.layout.bitmap_words),
                self.layout.bitmap_words,
            )
        }
    }

    /// Validate an id against the configured maximum
    pub fn check_id(&self, id: EventId) -> Result<()> {
        if id.as_value() > self.layout.event_id_max {
            return Err(EaselError::InvalidEventId {
                id: id.as_value(),
                max: self.layout.event_id_max,
            });
        }
        Ok(())
    }

    /// Mark `id` pending for every active listener and wake them; returns the
    /// number of listeners notified
    pub fn notify(&self, id: EventId) -> Result<usize> {
        self.check_id(id)?;
        let value = id.as_value();
        let listeners = self.listeners();

        let mut notified = 0;
        for listener in listeners.active() {
            self.bitmap(listener)[value / 64].fetch_or(1 << (value % 64), Ordering::AcqRel);
            if let Err(e) = futex::signal(self.futex(listener)) {
                warn!("Failed to wake listener {}: {}", listener, e);
            }
            notified += 1;
        }

        trace!("Event {} notified {} listeners", value, notified);
        Ok(notified)
    }

    /// Take the lowest pending id of a listener
    pub fn take_one(&self, listener: usize) -> Option<EventId> {
        for (index, word) in self.bitmap(listener).iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let mask = 1u64 << bit;
                let previous = word.fetch_and(!mask, Ordering::AcqRel);
                if previous & mask != 0 {
                    return Some(EventId::new(index * 64 + bit));
                }
                bits = previous & !mask;
            }
        }
        None
    }

    /// Take every pending id of a listener, lowest first
    pub fn take_all<F: FnMut(EventId)>(&self, listener: usize, mut callback: F) -> usize {
        let mut taken = 0;
        for (index, word) in self.bitmap(listener).iter().enumerate() {
            let mut bits = word.swap(0, Ordering::AcqRel);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                callback(EventId::new(index * 64 + bit));
                taken += 1;
            }
        }
        taken
    }

    /// Whether a listener has pending ids
    pub fn has_pending(&self, listener: usize) -> bool {
        self.bitmap(listener)
            .iter()
            .any(|word| word.load(Ordering::Acquire) != 0)
    }

    /// Forget all pending ids of a listener port
    pub fn clear(&self, listener: usize) {
        for word in self.bitmap(listener) {
            word.store(0, Ordering::Release);
        }
    }

    /// Release the ports of processes that died; returns `(notifiers,
    /// listeners)` reclaimed
    pub fn reclaim_dead_ports(&self) -> (usize, usize) {
        let notifiers = self.notifiers();
        let mut dead_notifiers = 0;
        for index in 0..notifiers.capacity() {
            if notifiers.claim_dead(index) {
                warn!(
                    "Reclaimed notifier port {} of dead process {}",
                    index,
                    notifiers.entry(index).pid()
                );
                notifiers.release(index);
                dead_notifiers += 1;
            }
        }

        let listeners = self.listeners();
        let mut dead_listeners = 0;
        for index in 0..listeners.capacity() {
            if listeners.claim_dead(index) {
                warn!(
                    "Reclaimed listener port {} of dead process {}",
                    index,
                    listeners.entry(index).pid()
                );
                self.clear(index);
                listeners.release(index);
                dead_listeners += 1;
            }
        }

        (dead_notifiers, dead_listeners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        memory::current_pid,
        service::{descriptor::EventSettings, name::ServiceName},
    };
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct Backing {
        ptr: *mut u8,
        layout: Layout,
        channel: EventChannel,
    }

    impl Drop for Backing {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn channel(event_id_max: u64) -> Backing {
        let config = Config::default();
        let settings = EventSettings {
            event_id_max_value: event_id_max,
            ..EventSettings::from(&config.defaults.event)
        };
        let descriptor = ServiceDescriptor::event(&ServiceName::new("events").unwrap(), settings);
        let event_layout = EventLayout::new(&descriptor).unwrap();
        let layout = Layout::from_size_align(event_layout.total, 64).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let channel = unsafe { EventChannel::init(ptr, event_layout) };
        Backing {
            ptr,
            layout,
            channel,
        }
    }

    fn listener(channel: &EventChannel) -> usize {
        let table = channel.listeners();
        let index = table.claim(current_pid(), channel.next_port_id()).unwrap();
        table.activate(index);
        index
    }

    #[test]
    fn test_notify_sets_pending_and_bumps_futex() {
        let backing = channel(127);
        let channel = backing.channel;
        let index = listener(&channel);

        let before = channel.futex(index).load(Ordering::Acquire);
        assert_eq!(channel.notify(EventId::new(70)).unwrap(), 1);
        assert_ne!(channel.futex(index).load(Ordering::Acquire), before);

        assert_eq!(channel.take_one(index), Some(EventId::new(70)));
        assert_eq!(channel.take_one(index), None);
    }

    #[test]
    fn test_pending_is_a_set() {
        let backing = channel(15);
        let channel = backing.channel;
        let index = listener(&channel);

        for id in [3, 1, 3, 3] {
            channel.notify(EventId::new(id)).unwrap();
        }

        let mut ids = Vec::new();
        assert_eq!(channel.take_all(index, |id| ids.push(id.as_value())), 2);
        assert_eq!(ids, vec![1, 3]);
        assert!(!channel.has_pending(index));
    }

    #[test]
    fn test_invalid_event_id() {
        let backing = channel(15);
        assert!(matches!(
            backing.channel.notify(EventId::new(16)),
            Err(EaselError::InvalidEventId { id: 16, max: 15 })
        ));
    }

    #[test]
    fn test_notify_without_listeners() {
        let backing = channel(15);
        assert_eq!(backing.channel.notify(EventId::new(0)).unwrap(), 0);
    }

    #[test]
    fn test_reclaim_dead_listener() {
        let backing = channel(15);
        let channel = backing.channel;
        let index = listener(&channel);
        channel.notify(EventId::new(2)).unwrap();

        channel.listeners().entry(index).set_pid(i32::MAX as u32 - 1);
        assert_eq!(channel.reclaim_dead_ports(), (0, 1));
        assert!(!channel.has_pending(index));
        assert_eq!(channel.notify(EventId::new(2)).unwrap(), 0);
    }
}
