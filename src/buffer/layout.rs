//! Shared-memory layout of the ring buffer control plane.
//!
//! Everything here is `#[repr(C)]` and lives inside the arena; the data
//! plane (the sample rows) follows as a raw byte band. Layout conformance is
//! asserted by `tests/layout.rs`.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Half-open `[start, end)` interval, as published to shared memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagRange {
    pub start: u64,
    pub end: u64,
}

/// Value of `last_accepted` before any write has been accepted.
pub const NO_WRITE_YET: u64 = u64::MAX;

/// Per-board control block.
///
/// Exactly one writer exists per board; readers in other processes only ever
/// load from this struct. The flag set is published under a seqlock:
/// `flag_seq` is incremented to an odd value before the writer touches the
/// flag slots and to an even value after, so a reader that observes the same
/// even value on both sides of its copy has a consistent snapshot.
#[repr(C, align(128))]
pub struct BoardHeader {
    pub board: u32,

    /// Writer claim word: 0 free, 1 claimed. Swapped by `SampleBuffer::writer`
    /// to enforce the single-writer contract across processes.
    pub writer_claim: AtomicU32,

    /// Logical end of the last accepted write, [`NO_WRITE_YET`] initially.
    pub last_accepted: AtomicU64,

    /// Seqlock word guarding the flag slots and `flag_count`.
    pub flag_seq: AtomicU64,

    /// Number of published flag slots.
    pub flag_count: AtomicU32,

    pub reserved: u32,

    /// Samples lost to detected gaps in the incoming stamp sequence.
    pub missed: CachePadded<AtomicU64>,

    /// Writes that overwrote still-valid data (the writer lapped a reader).
    pub rewritten: CachePadded<AtomicU64>,

    /// Frames rejected for carrying the unreliable-stamp sentinel.
    pub bad_stamp: CachePadded<AtomicU64>,
}

impl BoardHeader {
    pub fn new(board: u32) -> Self {
        Self {
            board,
            writer_claim: AtomicU32::new(0),
            last_accepted: AtomicU64::new(NO_WRITE_YET),
            flag_seq: AtomicU64::new(0),
            flag_count: AtomicU32::new(0),
            reserved: 0,
            missed: CachePadded::new(AtomicU64::new(0)),
            rewritten: CachePadded::new(AtomicU64::new(0)),
            bad_stamp: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

/// Snapshot of one board's event counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BoardCounters {
    pub missed: u64,
    pub rewritten: u64,
    pub bad_stamp: u64,
}
