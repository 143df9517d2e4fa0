//! Blocking on 32-bit words in shared memory
//!
//! A waiter reads the word, re-checks its own condition and then sleeps
//! only while the word still holds the value it read. Wakers change the
//! word before waking, so no wake-up falls between the check and the sleep.
//! Words live in mappings shared between processes, so the shared (not
//! `FUTEX_PRIVATE_FLAG`) operations are used. Platforms without futexes
//! poll the word instead.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use crate::error::{EaselError, Result};

/// Why a wait returned; callers re-check their condition in every case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A waker called [`wake`] on the word
    Woken,
    /// The word did not hold the expected value
    Changed,
    TimedOut,
    /// A signal handler ran
    Interrupted,
}

#[cfg(target_os = "linux")]
mod sys {
    use std::sync::atomic::AtomicU32;

    use nix::errno::Errno;

    /// Raw `futex(2)` call; only touches the word and errno, so it is safe
    /// to call from a signal handler
    pub fn futex(
        word: &AtomicU32,
        op: libc::c_int,
        value: u32,
        timeout: Option<&libc::timespec>,
    ) -> Result<usize, Errno> {
        let timeout = timeout.map_or(std::ptr::null(), |t| t as *const libc::timespec);
        // SAFETY: `word` is a live, aligned u32 for the duration of the call
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                op,
                value,
                timeout,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        Errno::result(ret).map(|woken| woken as usize)
    }
}

#[cfg(target_os = "linux")]
pub(crate) use sys::futex as raw_futex;

#[cfg(target_os = "linux")]
fn to_timespec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    }
}

/// Sleep while `*word == expected`, at most `timeout` if one is given
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<WaitOutcome> {
    use nix::errno::Errno;

    let timespec = timeout.map(to_timespec);
    match sys::futex(word, libc::FUTEX_WAIT, expected, timespec.as_ref()) {
        Ok(_) => Ok(WaitOutcome::Woken),
        Err(Errno::EAGAIN) => Ok(WaitOutcome::Changed),
        Err(Errno::ETIMEDOUT) => Ok(WaitOutcome::TimedOut),
        Err(Errno::EINTR) => Ok(WaitOutcome::Interrupted),
        Err(errno) => Err(EaselError::platform(format!("futex wait failed: {}", errno))),
    }
}

/// Wake up to `count` sleepers; returns how many were woken
#[cfg(target_os = "linux")]
pub fn wake(word: &AtomicU32, count: u32) -> Result<usize> {
    sys::futex(word, libc::FUTEX_WAKE, count.min(i32::MAX as u32), None)
        .map_err(|errno| EaselError::platform(format!("futex wake failed: {}", errno)))
}

#[cfg(not(target_os = "linux"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<WaitOutcome> {
    const POLL: Duration = Duration::from_micros(500);

    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        if word.load(Ordering::Acquire) != expected {
            return Ok(WaitOutcome::Changed);
        }
        match deadline {
            Some(deadline) if Instant::now() >= deadline => return Ok(WaitOutcome::TimedOut),
            _ => std::thread::sleep(POLL),
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wake(_word: &AtomicU32, _count: u32) -> Result<usize> {
    Ok(0)
}

/// Wait until `deadline` (forever if `None`), sleeping at most `slice` at a
/// time
///
/// Returns after the first wake-up, value change or slice end so the caller
/// can re-check its condition; returns `TimedOut` without sleeping once the
/// deadline has passed.
pub fn wait_until(
    word: &AtomicU32,
    expected: u32,
    deadline: Option<Instant>,
    slice: Option<Duration>,
) -> Result<WaitOutcome> {
    let remaining = match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            Some(deadline - now)
        }
        None => None,
    };

    let timeout = match (remaining, slice) {
        (Some(remaining), Some(slice)) => Some(remaining.min(slice)),
        (remaining, slice) => remaining.or(slice),
    };
    wait(word, expected, timeout)
}

/// Change the word and wake every sleeper
pub fn signal(word: &AtomicU32) -> Result<usize> {
    word.fetch_add(1, Ordering::Release);
    wake(word, u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wake_without_sleepers() {
        let word = AtomicU32::new(0);
        assert_eq!(wake(&word, 1).unwrap(), 0);
    }

    #[test]
    fn test_wait_on_changed_word_returns() {
        let word = AtomicU32::new(42);
        let start = Instant::now();
        let outcome = wait(&word, 0, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(outcome, WaitOutcome::Changed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let outcome = wait(&word, 0, Some(Duration::from_millis(30))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_wait_until_past_deadline() {
        let word = AtomicU32::new(0);
        let outcome = wait_until(&word, 0, Some(Instant::now()), None).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_wait_until_sleeps_one_slice() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let deadline = Instant::now() + Duration::from_secs(10);
        wait_until(&word, 0, Some(deadline), Some(Duration::from_millis(20))).unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(15));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_signal_wakes_sleeper() {
        let word = Arc::new(AtomicU32::new(0));

        let waker = {
            let word = word.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                signal(&word).unwrap();
            })
        };

        let initial = word.load(Ordering::Acquire);
        let deadline = Instant::now() + Duration::from_secs(2);
        while word.load(Ordering::Acquire) == initial {
            if wait_until(&word, initial, Some(deadline), None).unwrap() == WaitOutcome::TimedOut {
                break;
            }
        }
        assert_ne!(word.load(Ordering::Acquire), initial);
        waker.join().unwrap();
    }
}
