//! Shared memory segment with open-or-create semantics

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind as IoErrorKind,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use memmap2::{MmapOptions, MmapRaw};

use crate::{
    config::RecoveryPolicy,
    error::{EaselError, Result},
};

use super::{
    config::SegmentConfig,
    header::{AttachOutcome, SegmentHeader, HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION},
    liveness::{current_pid, is_process_alive},
};

/// Attempts before `open_or_create` gives up on a segment that keeps
/// being torn down underneath it
const MAX_OPEN_ATTEMPTS: usize = 64;

const RETRY_DELAY: Duration = Duration::from_millis(1);

enum AttachResult {
    Attached(SharedSegment),
    Retry,
}

/// A named, file-backed shared memory segment
///
/// Lifetime is tracked by the attachment counter in the segment header, not
/// by kernel handle counts. The last handle to detach unlinks the file.
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    path: PathBuf,
    size: usize,
    mmap: MmapRaw,
    _file: File,
    pid: u32,
    attachment_index: Option<usize>,
    created: bool,
}

// SAFETY: the mapping is shared memory that is only accessed through
// atomics or through structures whose access protocol is synchronised by
// atomics in the segment itself
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Open an existing segment or create it
    pub fn open_or_create(config: &SegmentConfig) -> Result<Self> {
        Self::open_or_create_with(config, |_| Ok(()))
    }

    /// Open an existing segment or create it, running `init` on the zeroed
    /// user area before the segment becomes visible to other openers
    pub fn open_or_create_with<F>(config: &SegmentConfig, mut init: F) -> Result<Self>
    where
        F: FnMut(*mut u8) -> Result<()>,
    {
        config.validate()?;
        let path = config.file_path();

        for _ in 0..MAX_OPEN_ATTEMPTS {
            let created = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(config.permissions)
                .open(&path);

            match created {
                Ok(file) => return Self::create(config, path, file, &mut init),
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    match Self::attach_existing(config, &path)? {
                        AttachResult::Attached(segment) => return Ok(segment),
                        AttachResult::Retry => thread::sleep(RETRY_DELAY),
                    }
                }
                Err(e) => return Err(map_os_error(e, &config.name, config.size)),
            }
        }

        Err(EaselError::platform(format!(
            "Segment {} kept disappearing while opening",
            config.name
        )))
    }

    fn create<F>(config: &SegmentConfig, path: PathBuf, file: File, init: &mut F) -> Result<Self>
    where
        F: FnMut(*mut u8) -> Result<()>,
    {
        let total = HEADER_SIZE + config.size;

        let mapped = file
            .set_len(total as u64)
            .map_err(|e| map_os_error(e, &config.name, total))
            .and_then(|_| map_file(&file, total, &config.name));

        let mmap = match mapped {
            Ok(mmap) => mmap,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };

        let pid = current_pid();
        let header = mmap.as_mut_ptr() as *mut SegmentHeader;
        // SAFETY: the file was created exclusively by us and is zero filled,
        // nobody reads past the magic until it is published
        unsafe { (*header).init(config.size as u64, pid) };

        // SAFETY: the user area directly follows the header inside the mapping
        let data = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };
        if let Err(e) = init(data) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        // SAFETY: see above
        unsafe { (*header).publish() };

        debug!("Created segment {} ({} bytes) at {:?}", config.name, total, path);

        Ok(Self {
            name: config.name.clone(),
            path,
            size: config.size,
            mmap,
            _file: file,
            pid,
            attachment_index: Some(0),
            created: true,
        })
    }

    fn attach_existing(config: &SegmentConfig, path: &Path) -> Result<AttachResult> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(AttachResult::Retry),
            Err(e) => return Err(map_os_error(e, &config.name, config.size)),
        };

        let deadline = Instant::now() + config.init_timeout;

        // the creator sizes the file right after creating it
        let len = loop {
            let len = file
                .metadata()
                .map_err(|e| EaselError::from_io(e, "Failed to stat segment"))?
                .len() as usize;
            if len > 0 {
                break len;
            }
            if Instant::now() >= deadline {
                // nobody ever sized the file; the creator died right away
                return Self::recover(config, path, None);
            }
            thread::sleep(RETRY_DELAY);
        };

        if len < HEADER_SIZE {
            return Err(EaselError::AlreadyExistsIncompatible {
                name: config.name.clone(),
            });
        }

        let mmap = map_file(&file, len, &config.name)?;
        // SAFETY: the mapping is at least one header long
        let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };

        loop {
            let magic = header.load_magic();
            if magic != 0 {
                break;
            }
            if Instant::now() >= deadline {
                let creator = header.creator_pid.load(std::sync::atomic::Ordering::Acquire);
                if creator != 0 && is_process_alive(creator) {
                    return Err(EaselError::platform(format!(
                        "Creator {} of segment {} did not finish initialisation",
                        creator, config.name
                    )));
                }
                return Self::recover(config, path, Some(header));
            }
            thread::sleep(RETRY_DELAY);
        }

        Self::validate(config, header, len)?;

        if header.is_stale() {
            return Self::recover(config, path, Some(header));
        }

        let pid = current_pid();
        match header.attach(pid) {
            AttachOutcome::Destroying => Ok(AttachResult::Retry),
            AttachOutcome::Attached(index) => {
                if index.is_none() {
                    warn!(
                        "Attachment table of segment {} is full, liveness of this process is not tracked",
                        config.name
                    );
                }
                debug!("Attached to segment {} at {:?}", config.name, path);
                Ok(AttachResult::Attached(Self {
                    name: config.name.clone(),
                    path: path.to_path_buf(),
                    size: config.size,
                    mmap,
                    _file: file,
                    pid,
                    attachment_index: index,
                    created: false,
                }))
            }
        }
    }

    fn validate(config: &SegmentConfig, header: &SegmentHeader, len: usize) -> Result<()> {
        let magic = header.load_magic();
        if magic != SEGMENT_MAGIC {
            return Err(EaselError::IncompatibleVersion {
                name: config.name.clone(),
                expected: SEGMENT_MAGIC,
                actual: magic,
            });
        }

        if header.version != SEGMENT_VERSION || header.header_size as usize != HEADER_SIZE {
            return Err(EaselError::IncompatibleVersion {
                name: config.name.clone(),
                expected: SEGMENT_VERSION as u64,
                actual: header.version as u64,
            });
        }

        if header.segment_size != config.size as u64 {
            return Err(EaselError::IncompatibleVersion {
                name: config.name.clone(),
                expected: config.size as u64,
                actual: header.segment_size,
            });
        }

        if len < HEADER_SIZE + config.size {
            return Err(EaselError::AlreadyExistsIncompatible {
                name: config.name.clone(),
            });
        }

        Ok(())
    }

    /// Apply the recovery policy to a segment whose owners are all gone
    fn recover(
        config: &SegmentConfig,
        path: &Path,
        header: Option<&SegmentHeader>,
    ) -> Result<AttachResult> {
        if config.recovery_policy == RecoveryPolicy::RejectStale {
            warn!("Segment {} is stale, recovery disabled", config.name);
            return Err(EaselError::StaleSegment {
                name: config.name.clone(),
            });
        }

        // only the process that flips the segment to destroying may unlink
        // it; everybody else retries and finds a fresh segment
        let claimed = match header {
            Some(header) => header.claim_stale(),
            None => true,
        };

        if claimed {
            info!("Reclaiming stale segment {} at {:?}", config.name, path);
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(EaselError::from_io(e, "Failed to remove stale segment")),
            }
        }

        Ok(AttachResult::Retry)
    }

    /// Name of the segment
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the user area
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the segment
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Pointer to the start of the user area
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the mapping is header plus user area long
        unsafe { self.mmap.as_mut_ptr().add(HEADER_SIZE) }
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping starts with a validated header
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    /// Pids of all processes currently attached
    pub fn attached_processes(&self) -> Vec<u32> {
        self.header().attached_pids()
    }

    /// Number of live attachments, including this one
    pub fn attach_count(&self) -> u64 {
        self.header().attach_count()
    }

    /// Liveness check over the attachment table
    pub fn is_stale(&self) -> bool {
        self.header().is_stale()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.header().detach(self.pid, self.attachment_index) {
            debug!("Last attachment of segment {} gone, unlinking", self.name);
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != IoErrorKind::NotFound {
                    warn!("Failed to unlink segment {}: {}", self.name, e);
                }
            }
        }
    }
}

fn map_file(file: &File, len: usize, name: &str) -> Result<MmapRaw> {
    MmapOptions::new()
        .len(len)
        .map_raw(file)
        .map_err(|e| map_os_error(e, name, len))
}

fn map_os_error(e: std::io::Error, name: &str, requested: usize) -> EaselError {
    match e.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => EaselError::PermissionDenied {
            name: name.to_string(),
        },
        Some(libc::ENOSPC) | Some(libc::ENOMEM) | Some(libc::EFBIG) => EaselError::OutOfSpace {
            name: name.to_string(),
            requested,
        },
        _ => EaselError::from_io(e, "Shared memory operation failed"),
    }
}
