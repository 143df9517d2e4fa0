//! Shared registry of all services in a root directory
//!
//! The registry is a well-known segment holding a lock word followed by a
//! fixed table of entries. A service is placed by hashing its name and
//! walking the table linearly from there:
//!
//! ```text
//!   FREE ──claim──> WRITING ──> READY ──last holder gone──> TOMBSTONE
//!                      ^                                        │
//!                      └─────────────── claim ──────────────────┘
//! ```
//!
//! Entries never return to FREE, so a lookup may stop at the first FREE
//! entry of its search chain; a create takes the first reusable entry of the
//! chain once no live entry of the same name was found.
//!
//! Every change happens under the lock word, which holds the pid of its
//! owner. A lock whose owner died is taken over, and an entry that was left
//! WRITING by that owner is treated as a tombstone. Each entry records the
//! pid behind every lease, so leases of crashed processes are dropped the
//! next time the entry is looked at.

use std::{
    cell::UnsafeCell,
    mem::size_of,
    ptr,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    config::Config,
    error::{EaselError, Result},
    memory::{current_pid, is_process_alive, SegmentConfig, SharedSegment},
};

use super::{descriptor::ServiceDescriptor, name::ServiceName};

/// Name of the registry segment inside the root directory
pub const REGISTRY_SEGMENT_NAME: &str = "registry";

/// Leases one entry can carry at the same time
pub const MAX_HOLDERS: usize = 64;

const FREE: u32 = 0;
const WRITING: u32 = 1;
const READY: u32 = 2;
const TOMBSTONE: u32 = 3;

const RETRY_DELAY: Duration = Duration::from_micros(200);

/// How a lookup treats a missing or existing service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail with `ServiceNotFound` if absent
    Open,
    /// Fail with `ServiceAlreadyExists` if present
    Create,
    OpenOrCreate,
}

#[repr(C, align(64))]
struct RegistryControl {
    /// Pid of the process changing the table, 0 when unlocked
    lock: AtomicU32,
}

/// One registry entry
#[repr(C, align(64))]
pub struct RegistryEntry {
    state: AtomicU32,
    _reserved: u32,
    /// Bumped every time the entry is claimed
    incarnation: AtomicU64,
    /// Pid behind each lease, 0 for an unused holder
    holders: [AtomicU32; MAX_HOLDERS],
    /// Written and read only under the registry lock
    descriptor: UnsafeCell<ServiceDescriptor>,
}

impl RegistryEntry {
    fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    fn read_descriptor(&self) -> ServiceDescriptor {
        // SAFETY: plain data in the mapping, only written under the lock
        // the caller holds
        unsafe { ptr::read_volatile(self.descriptor.get()) }
    }

    fn holder_count(&self) -> usize {
        self.holders
            .iter()
            .filter(|holder| holder.load(Ordering::Acquire) != 0)
            .count()
    }

    fn add_holder(&self, pid: u32) -> Option<usize> {
        self.holders.iter().position(|holder| {
            holder
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }
}

/// Membership of the caller in a registry entry
#[derive(Debug, Clone, Copy)]
pub struct RegistryLease {
    /// Position of the entry in the table
    pub index: usize,
    /// Incarnation of the entry when the lease was taken
    pub incarnation: u64,
    /// Holder position recording this lease
    pub holder: usize,
    /// Whether the caller published the descriptor
    pub created: bool,
    /// Descriptor as published by the creator
    pub descriptor: ServiceDescriptor,
}

/// Ownership of the registry lock word
struct RegistryGuard<'a> {
    lock: &'a AtomicU32,
    pid: u32,
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        if self
            .lock
            .compare_exchange(self.pid, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            warn!("Registry lock of process {} was taken over", self.pid);
        }
    }
}

/// Handle to the shared service registry
#[derive(Debug)]
pub struct Registry {
    segment: SharedSegment,
    capacity: usize,
    lock_timeout: Duration,
}

// SAFETY: entries are only accessed through atomics or under the registry
// lock described in the module docs
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    /// Open the registry of the configured root directory, creating it if
    /// needed
    pub fn open(config: &Config) -> Result<Self> {
        let capacity = config.global.max_services;
        let segment_config = SegmentConfig::new(
            REGISTRY_SEGMENT_NAME,
            size_of::<RegistryControl>() + capacity * size_of::<RegistryEntry>(),
            config,
        );
        // zero-filled memory is an unlocked table of FREE entries
        let segment = SharedSegment::open_or_create(&segment_config)?;

        debug!(
            "Opened service registry with {} entries at {:?}",
            capacity,
            segment.path()
        );

        Ok(Self {
            segment,
            capacity,
            lock_timeout: config.global.init_timeout,
        })
    }

    /// Number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn control(&self) -> &RegistryControl {
        // SAFETY: the segment starts with the 64-byte aligned control block
        unsafe { &*(self.segment.data_ptr() as *const RegistryControl) }
    }

    fn entry(&self, index: usize) -> &RegistryEntry {
        assert!(index < self.capacity, "registry index {} out of range", index);
        // SAFETY: `capacity` entries follow the control block
        unsafe {
            &*(self.segment.data_ptr().add(size_of::<RegistryControl>()) as *const RegistryEntry)
                .add(index)
        }
    }

    fn chain(&self, name: &ServiceName) -> impl Iterator<Item = usize> {
        let start = name.hash() as usize;
        let capacity = self.capacity;
        (0..capacity).map(move |step| (start + step) % capacity)
    }

    /// Take the registry lock, taking it over from a dead owner
    fn lock(&self) -> Result<RegistryGuard<'_>> {
        let lock = &self.control().lock;
        let pid = current_pid();
        let deadline = Instant::now().checked_add(self.lock_timeout);

        loop {
            let holder = match lock.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(RegistryGuard { lock, pid }),
                Err(holder) => holder,
            };

            if holder != pid
                && !is_process_alive(holder)
                && lock
                    .compare_exchange(holder, pid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                warn!("Took over registry lock of dead process {}", holder);
                return Ok(RegistryGuard { lock, pid });
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(EaselError::platform(format!(
                    "Registry lock held by process {} for more than {:?}",
                    holder, self.lock_timeout
                )));
            }
            thread::sleep(RETRY_DELAY);
        }
    }

    /// Drop leases of dead processes from a READY entry; returns true if
    /// none are left and the entry became a tombstone
    fn reclaim_dead_holders(&self, index: usize) -> bool {
        let entry = self.entry(index);
        for holder in &entry.holders {
            let pid = holder.load(Ordering::Acquire);
            if pid != 0
                && !is_process_alive(pid)
                && holder
                    .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                warn!(
                    "Dropped lease of dead process {} on registry entry {}",
                    pid, index
                );
            }
        }

        if entry.holder_count() > 0 {
            return false;
        }
        entry.state.store(TOMBSTONE, Ordering::Release);
        debug!("Registry entry {} is now a tombstone", index);
        true
    }

    /// Find or publish the descriptor of a service
    ///
    /// Kind and types of an existing service are checked against `requested`
    /// before any port or data segment is touched. Capacities of an existing
    /// service win over the requested ones.
    pub fn open_or_create(
        &self,
        name: &ServiceName,
        requested: &ServiceDescriptor,
        mode: OpenMode,
    ) -> Result<RegistryLease> {
        let _guard = self.lock()?;
        let mut reusable = None;

        for index in self.chain(name) {
            let entry = self.entry(index);
            match entry.state() {
                FREE => {
                    reusable.get_or_insert(index);
                    break;
                }
                READY => {
                    if self.reclaim_dead_holders(index) {
                        reusable.get_or_insert(index);
                        continue;
                    }
                    let existing = entry.read_descriptor();
                    if existing.name_bytes() != requested.name_bytes() {
                        continue;
                    }
                    if mode == OpenMode::Create {
                        return Err(EaselError::ServiceAlreadyExists {
                            service: name.to_string(),
                        });
                    }
                    existing.check_compatible(requested)?;

                    let holder = entry.add_holder(current_pid()).ok_or_else(|| {
                        EaselError::TooManyHandles {
                            service: name.to_string(),
                            max: MAX_HOLDERS,
                        }
                    })?;

                    debug!("Opened service {} at registry entry {}", name, index);
                    return Ok(RegistryLease {
                        index,
                        incarnation: entry.incarnation.load(Ordering::Acquire),
                        holder,
                        created: false,
                        descriptor: existing,
                    });
                }
                WRITING => {
                    // the lock is ours, so the writer died halfway
                    warn!("Registry entry {} was left half written", index);
                    reusable.get_or_insert(index);
                }
                TOMBSTONE => {
                    reusable.get_or_insert(index);
                }
                other => {
                    return Err(EaselError::memory(format!(
                        "Registry entry {} has corrupted state {}",
                        index, other
                    )));
                }
            }
        }

        if mode == OpenMode::Open {
            return Err(not_found(name));
        }
        let index = reusable.ok_or(EaselError::RegistryFull {
            capacity: self.capacity,
        })?;
        Ok(self.publish(index, requested))
    }

    /// Write the descriptor into a reusable entry and make it visible
    fn publish(&self, index: usize, descriptor: &ServiceDescriptor) -> RegistryLease {
        let entry = self.entry(index);
        entry.state.store(WRITING, Ordering::Release);
        let incarnation = entry.incarnation.fetch_add(1, Ordering::AcqRel) + 1;
        for holder in &entry.holders {
            holder.store(0, Ordering::Relaxed);
        }
        // SAFETY: the registry lock gives this process exclusive write access
        unsafe { ptr::write_volatile(entry.descriptor.get(), *descriptor) };
        entry.holders[0].store(current_pid(), Ordering::Release);
        entry.state.store(READY, Ordering::Release);

        debug!(
            "Created service {} at registry entry {} (incarnation {})",
            descriptor.name(),
            index,
            incarnation
        );

        RegistryLease {
            index,
            incarnation,
            holder: 0,
            created: true,
            descriptor: *descriptor,
        }
    }

    /// Give up a lease; returns true if it was the last one and the entry
    /// became a tombstone
    pub fn release(&self, lease: &RegistryLease) -> bool {
        let _guard = match self.lock() {
            Ok(guard) => guard,
            Err(e) => {
                // the lease is dropped once this process is gone
                warn!("Failed to release registry entry {}: {}", lease.index, e);
                return false;
            }
        };

        let entry = self.entry(lease.index);
        if entry.state() != READY || entry.incarnation.load(Ordering::Acquire) != lease.incarnation
        {
            warn!(
                "Registry entry {} was reclaimed while leased (incarnation {})",
                lease.index, lease.incarnation
            );
            return false;
        }

        let released = entry.holders[lease.holder]
            .compare_exchange(current_pid(), 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if !released {
            warn!(
                "Lease {} of registry entry {} is not held by this process",
                lease.holder, lease.index
            );
            return false;
        }

        if entry.holder_count() > 0 {
            return false;
        }
        entry.state.store(TOMBSTONE, Ordering::Release);
        debug!("Registry entry {} is now a tombstone", lease.index);
        true
    }

    /// Descriptor of a live service, without taking a lease
    pub fn find(&self, name: &ServiceName) -> Result<Option<ServiceDescriptor>> {
        let _guard = self.lock()?;
        for index in self.chain(name) {
            match self.entry(index).state() {
                FREE => break,
                READY if !self.reclaim_dead_holders(index) => {
                    let descriptor = self.entry(index).read_descriptor();
                    if descriptor.name_bytes() == name.as_str().as_bytes() {
                        return Ok(Some(descriptor));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Descriptors of all live services
    pub fn list(&self) -> Result<Vec<ServiceDescriptor>> {
        let _guard = self.lock()?;
        Ok((0..self.capacity)
            .filter(|&index| {
                self.entry(index).state() == READY && !self.reclaim_dead_holders(index)
            })
            .map(|index| self.entry(index).read_descriptor())
            .collect())
    }

    /// Number of leases on an entry, for introspection
    pub fn open_count(&self, index: usize) -> usize {
        let entry = self.entry(index);
        if entry.state() == READY {
            entry.holder_count()
        } else {
            0
        }
    }

    /// Name of the data segment belonging to a leased entry
    pub fn data_segment_name(name: &ServiceName, lease: &RegistryLease) -> String {
        format!("svc_{:08x}_{}", name.hash(), lease.index)
    }
}

fn not_found(name: &ServiceName) -> EaselError {
    EaselError::ServiceNotFound {
        service: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{
        descriptor::{EventSettings, PubSubSettings},
        types::TypeSignature,
    };
    use std::sync::{Arc, Barrier};

    const DEAD_PID: u32 = i32::MAX as u32 - 1;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config::default().with_root_dir(dir.path())
    }

    fn pubsub<T: crate::service::types::ZeroCopySend>(
        config: &Config,
        name: &ServiceName,
    ) -> ServiceDescriptor {
        ServiceDescriptor::publish_subscribe(
            name,
            TypeSignature::of::<T>(),
            TypeSignature::of::<()>(),
            PubSubSettings::from(&config.defaults.publish_subscribe),
        )
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("sensor/imu").unwrap();

        let first = registry
            .open_or_create(&name, &pubsub::<u64>(&config, &name), OpenMode::OpenOrCreate)
            .unwrap();
        assert!(first.created);

        let second = registry
            .open_or_create(&name, &pubsub::<u64>(&config, &name), OpenMode::OpenOrCreate)
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.index, first.index);
        assert_eq!(registry.open_count(first.index), 2);
    }

    #[test]
    fn test_creator_capacities_win() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("caps").unwrap();

        let mut requested = pubsub::<u64>(&config, &name);
        registry
            .open_or_create(&name, &requested, OpenMode::Create)
            .unwrap();

        requested = ServiceDescriptor::publish_subscribe(
            &name,
            TypeSignature::of::<u64>(),
            TypeSignature::of::<()>(),
            PubSubSettings {
                pool_capacity: 1000,
                ..PubSubSettings::from(&config.defaults.publish_subscribe)
            },
        );
        let lease = registry
            .open_or_create(&name, &requested, OpenMode::Open)
            .unwrap();
        assert_eq!(
            lease.descriptor.pubsub().pool_capacity,
            config.defaults.publish_subscribe.pool_capacity as u64
        );
    }

    #[test]
    fn test_type_mismatch_leaves_count_untouched() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("typed").unwrap();

        let lease = registry
            .open_or_create(&name, &pubsub::<u64>(&config, &name), OpenMode::OpenOrCreate)
            .unwrap();
        let result =
            registry.open_or_create(&name, &pubsub::<u32>(&config, &name), OpenMode::OpenOrCreate);
        assert!(matches!(result, Err(EaselError::IncompatibleType { .. })));

        let event = ServiceDescriptor::event(&name, EventSettings::from(&config.defaults.event));
        let result = registry.open_or_create(&name, &event, OpenMode::OpenOrCreate);
        assert!(matches!(result, Err(EaselError::IncompatibleKind { .. })));

        assert_eq!(registry.open_count(lease.index), 1);
    }

    #[test]
    fn test_open_and_create_modes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("modes").unwrap();
        let descriptor = pubsub::<u8>(&config, &name);

        assert!(matches!(
            registry.open_or_create(&name, &descriptor, OpenMode::Open),
            Err(EaselError::ServiceNotFound { .. })
        ));
        registry
            .open_or_create(&name, &descriptor, OpenMode::Create)
            .unwrap();
        assert!(matches!(
            registry.open_or_create(&name, &descriptor, OpenMode::Create),
            Err(EaselError::ServiceAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_release_tombstones_and_revives() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("revive").unwrap();
        let descriptor = pubsub::<u8>(&config, &name);

        let lease = registry
            .open_or_create(&name, &descriptor, OpenMode::OpenOrCreate)
            .unwrap();
        assert!(registry.find(&name).unwrap().is_some());
        assert!(registry.release(&lease));
        assert!(registry.find(&name).unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());

        let revived = registry
            .open_or_create(&name, &descriptor, OpenMode::OpenOrCreate)
            .unwrap();
        assert!(revived.created);
        assert_eq!(revived.index, lease.index);
        assert_eq!(revived.incarnation, lease.incarnation + 1);

        // a stale lease must not touch the new incarnation
        assert!(!registry.release(&lease));
        assert_eq!(registry.open_count(revived.index), 1);
    }

    #[test]
    fn test_registry_full() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.global.max_services = 2;
        let registry = Registry::open(&config).unwrap();

        for n in ["a", "b"] {
            let name = ServiceName::new(n).unwrap();
            registry
                .open_or_create(&name, &pubsub::<u8>(&config, &name), OpenMode::Create)
                .unwrap();
        }

        let name = ServiceName::new("c").unwrap();
        assert!(matches!(
            registry.open_or_create(&name, &pubsub::<u8>(&config, &name), OpenMode::Create),
            Err(EaselError::RegistryFull { capacity: 2 })
        ));
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_open_or_create_single_creator() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let name = ServiceName::new("race").unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let config = config.clone();
                let name = name.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let registry = Registry::open(&config).unwrap();
                    let descriptor = pubsub::<u64>(&config, &name);
                    barrier.wait();
                    let lease = registry
                        .open_or_create(&name, &descriptor, OpenMode::OpenOrCreate)
                        .unwrap();
                    (lease.created, lease.index, registry)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(created, _, _)| *created).count(), 1);
        let index = results[0].1;
        assert!(results.iter().all(|(_, i, _)| *i == index));
        assert_eq!(results[0].2.open_count(index), 8);
    }

    #[test]
    fn test_tombstones_reused_by_other_names() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.global.max_services = 2;
        let registry = Registry::open(&config).unwrap();

        for round in 0..4 {
            let leases: Vec<_> = ["a", "b"]
                .iter()
                .map(|n| {
                    let name = ServiceName::new(&format!("{}{}", n, round)).unwrap();
                    registry
                        .open_or_create(&name, &pubsub::<u8>(&config, &name), OpenMode::Create)
                        .unwrap()
                })
                .collect();
            for lease in &leases {
                assert!(registry.release(lease));
            }
        }
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_same_name_found_past_tombstone() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.global.max_services = 2;
        let registry = Registry::open(&config).unwrap();
        let first = ServiceName::new("first").unwrap();
        let second = ServiceName::new("second").unwrap();

        let first_lease = registry
            .open_or_create(&first, &pubsub::<u8>(&config, &first), OpenMode::Create)
            .unwrap();
        let second_lease = registry
            .open_or_create(&second, &pubsub::<u8>(&config, &second), OpenMode::Create)
            .unwrap();
        assert!(registry.release(&first_lease));

        // whichever entry the tombstone is, the live service must be opened
        let opened = registry
            .open_or_create(&second, &pubsub::<u8>(&config, &second), OpenMode::OpenOrCreate)
            .unwrap();
        assert!(!opened.created);
        assert_eq!(opened.index, second_lease.index);
    }

    #[test]
    fn test_dead_holder_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("crashed").unwrap();
        let descriptor = pubsub::<u8>(&config, &name);

        let lease = registry
            .open_or_create(&name, &descriptor, OpenMode::Create)
            .unwrap();
        registry.entry(lease.index).holders[1].store(DEAD_PID, Ordering::Release);
        assert_eq!(registry.open_count(lease.index), 2);

        assert!(registry.find(&name).unwrap().is_some());
        assert_eq!(registry.open_count(lease.index), 1);
        assert!(registry.release(&lease));

        // an entry held only by dead processes is gone on the next lookup
        let revived = registry
            .open_or_create(&name, &descriptor, OpenMode::Create)
            .unwrap();
        registry.entry(revived.index).holders[revived.holder].store(DEAD_PID, Ordering::Release);
        assert!(registry.find(&name).unwrap().is_none());
        let recreated = registry
            .open_or_create(&name, &descriptor, OpenMode::Create)
            .unwrap();
        assert!(recreated.created);
        assert_eq!(recreated.incarnation, revived.incarnation + 1);
    }

    #[test]
    fn test_half_written_entry_under_dead_lock_is_reused() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.global.max_services = 1;
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("half").unwrap();
        let descriptor = pubsub::<u8>(&config, &name);

        registry.control().lock.store(DEAD_PID, Ordering::Release);
        registry.entry(0).state.store(WRITING, Ordering::Release);

        let lease = registry
            .open_or_create(&name, &descriptor, OpenMode::Create)
            .unwrap();
        assert!(lease.created);
        assert_eq!(lease.index, 0);
        assert_eq!(registry.control().lock.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_handles_per_entry_are_bounded() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        let name = ServiceName::new("crowded").unwrap();
        let descriptor = pubsub::<u8>(&config, &name);

        let leases: Vec<_> = (0..MAX_HOLDERS)
            .map(|_| {
                registry
                    .open_or_create(&name, &descriptor, OpenMode::OpenOrCreate)
                    .unwrap()
            })
            .collect();
        assert!(matches!(
            registry.open_or_create(&name, &descriptor, OpenMode::Open),
            Err(EaselError::TooManyHandles { max: MAX_HOLDERS, .. })
        ));

        for lease in &leases[1..] {
            assert!(!registry.release(lease));
        }
        assert!(registry.release(&leases[0]));
    }
}
