// Shared memory backend for Linux.
// Regions live as files under /dev/shm so that their names are derivable
// from configuration alone and stale regions survive to be cleaned up.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// How to open a shared memory region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShmMode {
    /// Allocate a new zero-initialized region, replacing any stale one.
    Create,
    /// Allocate a new region, failing if one already exists under the key.
    CreateExclusive,
    /// Map an existing region read-only, waiting up to the timeout for the
    /// creator to bring it up.
    Attach,
    /// Map an existing region read-write, with the same wait behaviour.
    AttachReadWrite,
}

impl ShmMode {
    pub fn is_create(self) -> bool {
        matches!(self, ShmMode::Create | ShmMode::CreateExclusive)
    }
}

/// How often an attach retries while waiting for the creator.
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn region_path(key: &str) -> PathBuf {
    PathBuf::from(format!("/dev/shm/{}", key))
}

/// A mapped shared memory region.
///
/// The mapping is unmapped and the descriptor closed on drop; the backing
/// file persists until [`remove`] unlinks it, which is what lets consumer
/// processes outlive the creator's handle.
#[derive(Debug)]
pub struct ShmRegion {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    original_ptr: Option<(*mut u8, usize)>,
    writable: bool,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

#[cfg(target_os = "linux")]
pub fn open(key: &str, size: usize, mode: ShmMode, timeout: Duration) -> Result<ShmRegion> {
    match mode {
        ShmMode::Create => ShmRegion::create(key, size, false),
        ShmMode::CreateExclusive => ShmRegion::create(key, size, true),
        ShmMode::Attach => ShmRegion::attach(key, size, timeout, false),
        ShmMode::AttachReadWrite => ShmRegion::attach(key, size, timeout, true),
    }
}

/// Unlink the backing file for `key`. Returns false if no region existed.
pub fn remove(key: &str) -> Result<bool> {
    match std::fs::remove_file(region_path(key)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Shm(e)),
    }
}

/// True if a region currently exists under `key`.
pub fn exists(key: &str) -> bool {
    region_path(key).exists()
}

#[cfg(target_os = "linux")]
impl ShmRegion {
    fn create(key: &str, size: usize, exclusive: bool) -> Result<Self> {
        let aligned_size = (size + 127) & !127;
        let path = region_path(key);

        let mut options = OpenOptions::new();
        options.read(true).write(true).mode(0o600);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let file = options.open(&path).map_err(|e| {
            Error::Shm(io::Error::new(
                e.kind(),
                format!("failed to create shared memory file at {}: {}", path.display(), e),
            ))
        })?;

        // ftruncate on a fresh file gives zero-filled pages.
        if unsafe { libc::ftruncate(file.as_raw_fd(), aligned_size as i64) } != 0 {
            return Err(Error::Shm(io::Error::last_os_error()));
        }

        let fd = file.into_raw_fd();
        let (ptr, original_ptr) = Self::map(fd, aligned_size, true)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            fd,
            original_ptr,
            writable: true,
        })
    }

    fn attach(key: &str, size: usize, timeout: Duration, writable: bool) -> Result<Self> {
        let aligned_size = (size + 127) & !127;
        let path = region_path(key);

        // The producer and its consumers start in arbitrary order; poll for
        // the region rather than failing immediately.
        let deadline = Instant::now() + timeout;
        let file = loop {
            match OpenOptions::new().read(true).write(writable).open(&path) {
                Ok(file) => break file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if Instant::now() >= deadline {
                        return Err(Error::AttachTimeout {
                            key: key.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(ATTACH_POLL_INTERVAL.min(timeout));
                }
                Err(e) => return Err(Error::Shm(e)),
            }
        };

        let file_size = file.metadata().map_err(Error::Shm)?.len() as usize;
        if file_size < aligned_size {
            return Err(Error::Shm(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "shared memory region too small: expected at least {} bytes, got {}",
                    aligned_size, file_size
                ),
            )));
        }

        let fd = file.into_raw_fd();
        let (ptr, original_ptr) = Self::map(fd, file_size, writable)?;

        Ok(Self {
            ptr,
            size: file_size,
            fd,
            original_ptr,
            writable,
        })
    }

    fn map(fd: i32, size: usize, writable: bool) -> Result<(NonNull<u8>, Option<(*mut u8, usize)>)> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        unsafe {
            let total_size = size + 127; // extra space to keep a 128-byte aligned view
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                total_size,
                prot,
                libc::MAP_SHARED,
                fd,
                0,
            );

            if ptr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(Error::Shm(err));
            }

            let aligned_ptr = ((ptr as usize + 127) & !127) as *mut u8;
            match NonNull::new(aligned_ptr) {
                Some(nn) => Ok((nn, Some((ptr as *mut u8, total_size)))),
                None => {
                    libc::munmap(ptr, total_size);
                    libc::close(fd);
                    Err(Error::Shm(io::Error::new(
                        io::ErrorKind::Other,
                        "mmap returned a null mapping",
                    )))
                }
            }
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

#[cfg(target_os = "linux")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            if let Some((ptr, size)) = self.original_ptr {
                libc::munmap(ptr as *mut libc::c_void, size);
            } else {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
            libc::close(self.fd);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn open(_key: &str, _size: usize, _mode: ShmMode, _timeout: Duration) -> Result<ShmRegion> {
    Err(Error::Shm(io::Error::new(
        io::ErrorKind::Unsupported,
        "shared memory only supported on Linux",
    )))
}
