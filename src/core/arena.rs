use std::fmt;
use std::io;
use std::mem::{align_of, size_of};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::shm::{self, ShmMode, ShmRegion};
use crate::error::{Error, Result};

const MAGIC_NUMBER: u64 = 0x4245414D_5F4D454D; // "BEAM_MEM"
const LAYOUT_VERSION: u32 = 1;

/// Control block at the very beginning of every arena region.
#[repr(C, align(128))]
pub struct ArenaHeader {
    /// Identifies the region as a beamline arena.
    pub magic: u64,
    /// Version of the arena layout.
    pub version: u32,
    pub reserved: u32,
    /// Bump pointer: offset of the first free byte. Written only by the
    /// creating process, before any attacher can observe the region.
    pub next_offset: u64,
}

/// A named shared memory region carved into typed sub-objects.
///
/// The arena is a bump allocator: allocations are never reclaimed
/// individually, the region lives for one acquisition run. Exactly one
/// process creates the arena and performs all allocations; attaching
/// processes replay the identical allocation sequence locally to recover the
/// same offsets without touching the shared bump pointer.
pub struct SharedMemoryArena {
    shm: ShmRegion,
    header: *mut ArenaHeader,
    next: Mutex<usize>,
    creator: bool,
}

unsafe impl Send for SharedMemoryArena {}
unsafe impl Sync for SharedMemoryArena {}

impl SharedMemoryArena {
    /// Create a new zero-initialized arena under `key`.
    ///
    /// With `exclusive` set, creation fails if a region already exists; the
    /// default replaces any stale region from a crashed prior run.
    pub fn create(key: &str, size: usize, exclusive: bool) -> Result<Self> {
        let mode = if exclusive {
            ShmMode::CreateExclusive
        } else {
            ShmMode::Create
        };
        let shm = shm::open(key, size, mode, Duration::ZERO)?;

        let header = shm.as_ptr() as *mut ArenaHeader;
        Self::check_alignment(header)?;

        let base = Self::base_offset();
        unsafe {
            std::ptr::write(
                header,
                ArenaHeader {
                    magic: MAGIC_NUMBER,
                    version: LAYOUT_VERSION,
                    reserved: 0,
                    next_offset: base as u64,
                },
            );
        }

        Ok(Self {
            shm,
            header,
            next: Mutex::new(base),
            creator: true,
        })
    }

    /// Attach to an existing arena, waiting up to `timeout` for the creator.
    pub fn attach(key: &str, size: usize, timeout: Duration) -> Result<Self> {
        Self::attach_with_mode(key, size, timeout, ShmMode::Attach)
    }

    /// Attach with write access to the mapped pages. Logical write access is
    /// still governed by the buffer's exclusive-writer handles.
    pub fn attach_read_write(key: &str, size: usize, timeout: Duration) -> Result<Self> {
        Self::attach_with_mode(key, size, timeout, ShmMode::AttachReadWrite)
    }

    fn attach_with_mode(key: &str, size: usize, timeout: Duration, mode: ShmMode) -> Result<Self> {
        let shm = shm::open(key, size, mode, timeout)?;

        let header = shm.as_ptr() as *mut ArenaHeader;
        Self::check_alignment(header)?;

        unsafe {
            if (*header).magic != MAGIC_NUMBER {
                return Err(Error::Shm(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid magic number - region is not an initialized arena",
                )));
            }
            if (*header).version != LAYOUT_VERSION {
                return Err(Error::Shm(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "arena layout version mismatch: stored {}, expected {}",
                        (*header).version,
                        LAYOUT_VERSION
                    ),
                )));
            }
        }

        Ok(Self {
            shm,
            header,
            next: Mutex::new(Self::base_offset()),
            creator: false,
        })
    }

    fn base_offset() -> usize {
        (size_of::<ArenaHeader>() + 127) & !127
    }

    fn check_alignment(header: *const ArenaHeader) -> Result<()> {
        if (header as usize) % 128 != 0 {
            return Err(Error::Shm(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory not properly aligned",
            )));
        }
        Ok(())
    }

    /// Reserve `size` bytes at the given alignment and return their offset.
    ///
    /// On an attached arena this only advances the local mirror of the bump
    /// pointer; replaying the creator's allocation sequence yields the same
    /// offsets.
    pub fn allocate(&self, size: usize, align: usize) -> Result<usize> {
        debug_assert!(align.is_power_of_two());
        let mut next = self.next.lock();

        let offset = (*next + align - 1) & !(align - 1);
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::Shm(io::Error::new(io::ErrorKind::InvalidInput, "allocation overflow")))?;
        if end > self.shm.size() {
            return Err(Error::Shm(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "not enough space in shared memory: need {} bytes at offset {}, region holds {}",
                    size,
                    offset,
                    self.shm.size()
                ),
            )));
        }

        *next = end;
        if self.creator {
            unsafe {
                (*self.header).next_offset = end as u64;
            }
        }
        Ok(offset)
    }

    /// Allocate storage for one `T`.
    pub fn allocate_value<T>(&self) -> Result<usize> {
        self.allocate(size_of::<T>(), align_of::<T>().max(128))
    }

    /// Allocate storage for a `[T; len]`.
    pub fn allocate_array<T>(&self, len: usize) -> Result<usize> {
        self.allocate(size_of::<T>() * len, align_of::<T>().max(128))
    }

    fn check_range(&self, offset: usize, size: usize, align: usize) -> Result<()> {
        if offset % align != 0 || offset + size > self.shm.size() {
            return Err(Error::Shm(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "out-of-bounds or misaligned view: offset {}, size {}, region {}",
                    offset,
                    size,
                    self.shm.size()
                ),
            )));
        }
        Ok(())
    }

    /// Bounds-checked typed view of a previously allocated sub-object.
    ///
    /// # Safety
    /// `offset` must come from an `allocate*` call for a `T`, and `T` must be
    /// valid for any bit pattern the other side may have stored.
    pub unsafe fn view<T>(&self, offset: usize) -> Result<&T> {
        self.check_range(offset, size_of::<T>(), align_of::<T>())?;
        Ok(&*(self.shm.as_ptr().add(offset) as *const T))
    }

    /// Bounds-checked raw byte view.
    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<*mut u8> {
        self.check_range(offset, len, 1)?;
        Ok(unsafe { self.shm.as_ptr().add(offset) })
    }

    /// Offset of the first allocation, right after the header block.
    pub fn first_offset() -> usize {
        Self::base_offset()
    }

    pub fn size(&self) -> usize {
        self.shm.size()
    }

    /// Bytes handed out so far, as recorded by the creating process.
    pub fn used(&self) -> usize {
        unsafe { (*self.header).next_offset as usize }
    }

    pub fn remaining(&self) -> usize {
        self.size().saturating_sub(self.used())
    }

    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// True if the header carries a valid magic number.
    pub fn is_initialized(&self) -> bool {
        unsafe { !self.header.is_null() && (*self.header).magic == MAGIC_NUMBER }
    }
}

// Debug must not wander through shared state that another process owns; print
// pointers and bookkeeping only.
impl fmt::Debug for SharedMemoryArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryArena")
            .field("header", &format_args!("{:p}", self.header))
            .field("size", &self.size())
            .field("creator", &self.creator)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
