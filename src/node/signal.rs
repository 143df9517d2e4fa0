//! Shutdown signal handling
//!
//! Handlers only touch async-signal-safe state: an atomic flag and the
//! process wake word, which [`crate::Node::wait`] sleeps on. Listeners sleep
//! on futex words of their own, so they register those words for the
//! duration of a wait. A shutdown request signals the words registered by
//! the requesting node; for signals, a relay thread started with the first
//! handler signals every registered word. Handlers are installed without
//! `SA_RESTART` so blocking system calls return `EINTR`.

use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::{
    error::{EaselError, Result},
    sync::futex,
};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Bumped on every shutdown request, signal or programmatic
static WAKE_WORD: AtomicU32 = AtomicU32::new(0);

static INSTALLED: Mutex<Vec<Signal>> = Mutex::new(Vec::new());

static RELAY_STARTED: AtomicBool = AtomicBool::new(false);

/// Futex words of waits currently blocked, with the handle they wait for
static SLEEPERS: Mutex<Vec<Sleeper>> = Mutex::new(Vec::new());

static NEXT_SLEEPER: AtomicU64 = AtomicU64::new(1);

const RELAY_BACKOFF: Duration = Duration::from_millis(10);

struct Sleeper {
    id: u64,
    /// Address of the owning [`ShutdownHandle`]
    owner: usize,
    /// Address of the registered word
    word: usize,
}

extern "C" fn on_shutdown_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::Release);
    WAKE_WORD.fetch_add(1, Ordering::Release);
    #[cfg(target_os = "linux")]
    let _ = futex::raw_futex(&WAKE_WORD, libc::FUTEX_WAKE, i32::MAX as u32, None);
}

/// Install the shutdown handler for `signals`; installing twice is a no-op
pub fn install_handlers(signals: &[Signal]) -> Result<()> {
    let mut installed = INSTALLED.lock().unwrap_or_else(|e| e.into_inner());
    start_relay()?;

    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for &signal in signals {
        if installed.contains(&signal) {
            continue;
        }
        // SAFETY: the handler only uses async-signal-safe operations
        unsafe { sigaction(signal, &action) }.map_err(|e| {
            EaselError::platform(format!("Failed to install handler for {}: {}", signal, e))
        })?;
        installed.push(signal);
        debug!("Installed shutdown handler for {}", signal);
    }
    Ok(())
}

fn start_relay() -> Result<()> {
    if RELAY_STARTED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    thread::Builder::new()
        .name("easel-shutdown".into())
        .spawn(relay_signals)
        .map(|_| ())
        .map_err(|e| {
            RELAY_STARTED.store(false, Ordering::Release);
            EaselError::from_io(e, "Failed to start shutdown relay")
        })
}

/// Turn a received signal into wake-ups of every registered wait
fn relay_signals() {
    let mut token = WAKE_WORD.load(Ordering::Acquire);
    loop {
        if SIGNALLED.load(Ordering::Acquire) {
            wake_sleepers(None);
        }
        if let Err(e) = futex::wait(&WAKE_WORD, token, None) {
            warn!("Shutdown relay wait failed: {}", e);
            thread::sleep(RELAY_BACKOFF);
        }
        token = WAKE_WORD.load(Ordering::Acquire);
    }
}

/// Signal registered words, only those of `owner` if given
fn wake_sleepers(owner: Option<usize>) {
    let sleepers = SLEEPERS.lock().unwrap_or_else(|e| e.into_inner());
    for sleeper in sleepers.iter() {
        if owner.map_or(true, |owner| owner == sleeper.owner) {
            // SAFETY: a word stays registered only while the wait that
            // borrows it runs; deregistration takes the same lock
            let word = unsafe { &*(sleeper.word as *const AtomicU32) };
            if let Err(e) = futex::signal(word) {
                warn!("Failed to wake sleeper {}: {}", sleeper.id, e);
            }
        }
    }
}

/// Whether a shutdown signal has been received by this process
pub fn signal_received() -> bool {
    SIGNALLED.load(Ordering::Acquire)
}

/// Keeps a futex word registered for shutdown wake-ups
#[must_use]
pub struct SleeperGuard<'a> {
    id: u64,
    _word: PhantomData<&'a AtomicU32>,
}

impl Drop for SleeperGuard<'_> {
    fn drop(&mut self) {
        let mut sleepers = SLEEPERS.lock().unwrap_or_else(|e| e.into_inner());
        sleepers.retain(|sleeper| sleeper.id != self.id);
    }
}

/// Shutdown state of one node: process wide signals plus explicit requests
#[derive(Debug, Default)]
pub struct ShutdownHandle {
    requested: AtomicBool,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Request shutdown of the owning node and wake its blocking waits
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        if let Err(e) = futex::signal(&WAKE_WORD) {
            warn!("Failed to wake node waits: {}", e);
        }
        wake_sleepers(Some(self.key()));
    }

    /// Whether shutdown was requested by signal or by [`ShutdownHandle::request`]
    pub fn is_requested(&self) -> bool {
        signal_received() || self.requested.load(Ordering::Acquire)
    }

    /// Have `word` signalled when shutdown is requested, until the guard is
    /// dropped
    ///
    /// Check [`ShutdownHandle::is_requested`] after registering and before
    /// sleeping on `word`.
    pub fn register_sleeper<'a>(&self, word: &'a AtomicU32) -> SleeperGuard<'a> {
        let id = NEXT_SLEEPER.fetch_add(1, Ordering::Relaxed);
        SLEEPERS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Sleeper {
                id,
                owner: self.key(),
                word: word as *const AtomicU32 as usize,
            });
        SleeperGuard {
            id,
            _word: PhantomData,
        }
    }

    /// Current value of the wake word; pass it to [`ShutdownHandle::sleep`]
    pub fn wake_token(&self) -> u32 {
        WAKE_WORD.load(Ordering::Acquire)
    }

    /// Sleep until `deadline` (or indefinitely) unless a shutdown request
    /// arrives after `token` was taken
    pub fn sleep(&self, token: u32, deadline: Option<Instant>) -> Result<()> {
        futex::wait_until(&WAKE_WORD, token, deadline, None).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_request_is_local() {
        let first = ShutdownHandle::new();
        let second = ShutdownHandle::new();
        first.request();
        assert!(first.is_requested());
        assert!(!second.is_requested() || signal_received());
    }

    #[test]
    fn test_request_wakes_sleeper() {
        let handle = Arc::new(ShutdownHandle::new());
        let token = handle.wake_token();

        let requester = {
            let handle = handle.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                handle.request();
            })
        };

        let start = Instant::now();
        let deadline = start + Duration::from_secs(5);
        while !handle.is_requested() && Instant::now() < deadline {
            handle.sleep(token, Some(deadline)).unwrap();
        }
        assert!(handle.is_requested());
        assert!(start.elapsed() < Duration::from_secs(5));
        requester.join().unwrap();
    }

    #[test]
    fn test_request_signals_registered_words() {
        let handle = ShutdownHandle::new();
        let other = ShutdownHandle::new();
        let mine = AtomicU32::new(0);
        let theirs = AtomicU32::new(0);

        let _mine_guard = handle.register_sleeper(&mine);
        let _theirs_guard = other.register_sleeper(&theirs);
        handle.request();

        assert_ne!(mine.load(Ordering::Acquire), 0);
        assert_eq!(theirs.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_dropped_guard_is_not_signalled() {
        let handle = ShutdownHandle::new();
        let word = AtomicU32::new(0);
        drop(handle.register_sleeper(&word));
        handle.request();
        assert_eq!(word.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_install_handlers_twice() {
        install_handlers(&[Signal::SIGUSR2]).unwrap();
        install_handlers(&[Signal::SIGUSR2]).unwrap();
    }
}
