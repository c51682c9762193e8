//! Time-indexed, shared-memory-backed ring buffer.
//!
//! One process creates a [`SampleBuffer`] (the receiver host); every
//! consumer process attaches to the same region and gets read-only logical
//! access. Per board there is exactly one [`BoardWriter`] and any number of
//! [`BoardReader`]s. The writer handle is not clonable and the claim is
//! enforced through a shared claim word.
//!
//! The buffer always favors the producer: a write over still-valid data
//! proceeds, invalidates the lapped range and bumps the rewritten counter. A
//! lagging reader loses data; it never stalls ingestion. Readers therefore
//! get a consistent *validity* snapshot but may observe torn sample bytes in
//! ranges that were overwritten after the snapshot; the validity mask is the
//! semantic source of truth.

use std::fmt;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use crate::buffer::layout::{BoardCounters, BoardHeader, FlagRange, NO_WRITE_YET};
use crate::buffer::settings::BufferSettings;
use crate::buffer::validity::ValidityRanges;
use crate::core::arena::SharedMemoryArena;
use crate::core::shm;
use crate::error::{Error, Result};
use crate::timestamp::TimeStamp;

/// Outcome of a single write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Payload stored; `overwrote` marks a collision with still-valid data,
    /// `missed` the samples skipped by a gap ahead of the expected stamp.
    Written { overwrote: bool, missed: u64 },
    /// Stamp at or behind the last accepted write; buffer untouched.
    Stale,
}

/// A time-indexed ring buffer over a configuration-keyed shared arena.
pub struct SampleBuffer {
    arena: SharedMemoryArena,
    settings: BufferSettings,
    boards: *mut BoardHeader,
    flags: *mut FlagRange,
    samples: *mut u8,
    writable: bool,
}

unsafe impl Send for SampleBuffer {}
unsafe impl Sync for SampleBuffer {}

impl SampleBuffer {
    /// Arena bytes needed for `settings`, including all alignment slack.
    pub fn required_size(settings: &BufferSettings) -> usize {
        let align = |x: usize| (x + 127) & !127;
        let n_boards = settings.n_boards as usize;
        let mut total = SharedMemoryArena::first_offset();
        total += align(size_of::<BufferSettings>());
        total += align(size_of::<BoardHeader>() * n_boards);
        total += align(size_of::<FlagRange>() * n_boards * settings.flag_ranges as usize);
        total += align(settings.n_channels() as usize * settings.channel_bytes());
        total + 128
    }

    /// Create the buffer region for `settings`, replacing any stale region
    /// left by a crashed prior run. Called exactly once per acquisition run,
    /// by the process that hosts the packet receivers.
    pub fn create(settings: BufferSettings) -> Result<Self> {
        let key = settings.region_key();
        let arena = SharedMemoryArena::create(&key, Self::required_size(&settings), false)?;
        let (settings_off, boards_off, flags_off, samples_off) = Self::plan(&arena, &settings)?;

        unsafe {
            ptr::write(
                arena.bytes_at(settings_off, size_of::<BufferSettings>())? as *mut BufferSettings,
                settings,
            );
            let boards = arena.bytes_at(boards_off, 1)? as *mut BoardHeader;
            for b in 0..settings.n_boards {
                ptr::write(boards.add(b as usize), BoardHeader::new(b));
            }
        }
        // Flag slots and sample rows start zeroed; nothing is valid yet.

        Self::assemble(arena, settings, settings_off, boards_off, flags_off, samples_off, true)
    }

    /// Attach to an existing buffer region, waiting up to `timeout` for the
    /// creator. The locally computed `settings` must be byte-identical to
    /// the stored record or the attach fails with [`Error::SettingsMismatch`].
    pub fn attach(settings: BufferSettings, timeout: Duration) -> Result<Self> {
        let key = settings.region_key();
        let arena = SharedMemoryArena::attach(&key, Self::required_size(&settings), timeout)?;
        Self::attach_common(arena, settings, false)
    }

    /// Attach with write access to the mapped pages, for a process that will
    /// take over a board's writer handle.
    pub fn attach_read_write(settings: BufferSettings, timeout: Duration) -> Result<Self> {
        let key = settings.region_key();
        let arena =
            SharedMemoryArena::attach_read_write(&key, Self::required_size(&settings), timeout)?;
        Self::attach_common(arena, settings, true)
    }

    fn attach_common(
        arena: SharedMemoryArena,
        settings: BufferSettings,
        writable: bool,
    ) -> Result<Self> {
        let (settings_off, boards_off, flags_off, samples_off) = Self::plan(&arena, &settings)?;

        let stored: &BufferSettings = unsafe { arena.view(settings_off)? };
        if stored.as_bytes() != settings.as_bytes() {
            return Err(Error::SettingsMismatch);
        }

        Self::assemble(arena, settings, settings_off, boards_off, flags_off, samples_off, writable)
    }

    /// Replay the creation-time allocation sequence; offsets are a pure
    /// function of the settings, so creator and attachers agree.
    fn plan(
        arena: &SharedMemoryArena,
        settings: &BufferSettings,
    ) -> Result<(usize, usize, usize, usize)> {
        let n_boards = settings.n_boards as usize;
        let settings_off = arena.allocate_value::<BufferSettings>()?;
        let boards_off = arena.allocate_array::<BoardHeader>(n_boards)?;
        let flags_off =
            arena.allocate_array::<FlagRange>(n_boards * settings.flag_ranges as usize)?;
        let samples_off =
            arena.allocate(settings.n_channels() as usize * settings.channel_bytes(), 128)?;
        Ok((settings_off, boards_off, flags_off, samples_off))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        arena: SharedMemoryArena,
        settings: BufferSettings,
        _settings_off: usize,
        boards_off: usize,
        flags_off: usize,
        samples_off: usize,
        writable: bool,
    ) -> Result<Self> {
        let boards = arena.bytes_at(boards_off, size_of::<BoardHeader>() * settings.n_boards as usize)?
            as *mut BoardHeader;
        let flags = arena.bytes_at(
            flags_off,
            size_of::<FlagRange>() * (settings.n_boards * settings.flag_ranges) as usize,
        )? as *mut FlagRange;
        let samples =
            arena.bytes_at(samples_off, settings.n_channels() as usize * settings.channel_bytes())?;
        Ok(Self {
            arena,
            settings,
            boards,
            flags,
            samples,
            writable,
        })
    }

    /// Unlink the region for `settings`. Run only after every attached
    /// process has detached. Returns false if no region existed.
    pub fn remove(settings: &BufferSettings) -> Result<bool> {
        shm::remove(&settings.region_key())
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    pub fn arena(&self) -> &SharedMemoryArena {
        &self.arena
    }

    fn check_board(&self, board: u32) -> Result<()> {
        if board >= self.settings.n_boards {
            return Err(Error::Config(format!(
                "board {} out of range (buffer holds {})",
                board, self.settings.n_boards
            )));
        }
        Ok(())
    }

    fn header(&self, board: u32) -> &BoardHeader {
        unsafe { &*self.boards.add(board as usize) }
    }

    fn flag_slots(&self, board: u32) -> *mut FlagRange {
        unsafe {
            self.flags
                .add(board as usize * self.settings.flag_ranges as usize)
        }
    }

    fn channel_row(&self, channel: u32) -> *mut u8 {
        unsafe { self.samples.add(channel as usize * self.settings.channel_bytes()) }
    }

    /// Claim the exclusive writer handle for `board`.
    ///
    /// Fails if the mapping is read-only or the board's writer already
    /// exists, in this or any other process.
    pub fn writer(&self, board: u32) -> Result<BoardWriter<'_>> {
        self.check_board(board)?;
        if !self.writable {
            return Err(Error::Config(
                "cannot claim a writer on a read-only attachment".into(),
            ));
        }
        let header = self.header(board);
        if header
            .writer_claim
            .compare_exchange(0, 1, Ordering::AcqRel, Relaxed)
            .is_err()
        {
            return Err(Error::Config(format!(
                "writer for board {} is already claimed",
                board
            )));
        }
        let validity = self.snapshot_validity(board);
        Ok(BoardWriter {
            buf: self,
            board,
            validity,
        })
    }

    /// A read-only handle for `board`. Freely duplicable.
    pub fn reader(&self, board: u32) -> Result<BoardReader<'_>> {
        self.check_board(board)?;
        Ok(BoardReader { buf: self, board })
    }

    /// Event counter snapshot for one board.
    pub fn counters(&self, board: u32) -> BoardCounters {
        let header = self.header(board);
        BoardCounters {
            missed: header.missed.load(Relaxed),
            rewritten: header.rewritten.load(Relaxed),
            bad_stamp: header.bad_stamp.load(Relaxed),
        }
    }

    /// Consistent snapshot of one board's validity set (seqlock read side).
    fn snapshot_validity(&self, board: u32) -> ValidityRanges {
        let header = self.header(board);
        let slots = self.flag_slots(board);
        let max = self.settings.flag_ranges as usize;
        loop {
            let s1 = header.flag_seq.load(Acquire);
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let count = (header.flag_count.load(Relaxed) as usize).min(max);
            let mut copy = Vec::with_capacity(count);
            for i in 0..count {
                copy.push(unsafe { ptr::read_volatile(slots.add(i)) });
            }
            fence(Acquire);
            if header.flag_seq.load(Relaxed) == s1 {
                return ValidityRanges::load(&copy, max);
            }
            std::hint::spin_loop();
        }
    }
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("key", &self.settings.region_key())
            .field("boards", &self.settings.n_boards)
            .field("capacity", &self.settings.capacity)
            .field("samples", &format_args!("0x{:x}", self.samples as usize))
            .finish_non_exhaustive()
    }
}

/// Exclusive writer for one board. Not clonable; dropped handles release the
/// claim so the board can be re-claimed after a receiver restart.
pub struct BoardWriter<'a> {
    buf: &'a SampleBuffer,
    board: u32,
    validity: ValidityRanges,
}

impl BoardWriter<'_> {
    pub fn board(&self) -> u32 {
        self.board
    }

    /// Store `count` time samples for every beamlet of this board, starting
    /// at `stamp`. `samples` is laid out `[beamlet][time]`, matching the
    /// frame payload, and must hold exactly
    /// `count * beamlets_per_board * bytes_per_sample` bytes.
    pub fn write(&mut self, stamp: TimeStamp, count: usize, samples: &[u8]) -> WriteOutcome {
        let s = self.buf.settings;
        assert_eq!(
            samples.len(),
            count * (s.beamlets_per_board * s.bytes_per_sample) as usize,
            "payload size does not match beamlet count and sample width"
        );

        assert!(
            count as u64 <= s.capacity,
            "a single write cannot span more than one capacity window"
        );

        let header = self.buf.header(self.board);
        let index = stamp.index();
        let end = index + count as u64;

        let last = header.last_accepted.load(Acquire);
        if last != NO_WRITE_YET && index < last {
            return WriteOutcome::Stale;
        }

        let mut missed = 0;
        if last != NO_WRITE_YET && index > last {
            missed = index - last;
            header.missed.fetch_add(missed, Relaxed);
        }

        let capacity = s.capacity;
        let mut overwrote = false;
        if end > capacity {
            // The physical slots we are about to fill are shared with every
            // logical range that lands on the same window modulo capacity,
            // however many laps behind. A range collides if some shifted copy
            // [index - k*capacity, end - k*capacity) intersects it.
            let horizon = end - capacity;
            for r in self.validity.ranges() {
                let r_end = r.end.min(horizon);
                if r.start >= r_end {
                    continue;
                }
                let lap = (index - r_end) / capacity + 1;
                if end > r.start + lap * capacity {
                    overwrote = true;
                    header.rewritten.fetch_add(1, Relaxed);
                    break;
                }
            }
            self.validity.trim_before(horizon);
        }

        let sample_bytes = s.bytes_per_sample as usize;
        let phys = stamp.physical(capacity) as usize;
        for beamlet in 0..s.beamlets_per_board {
            let channel = self.board * s.beamlets_per_board + beamlet;
            let src = &samples[beamlet as usize * count * sample_bytes..][..count * sample_bytes];
            self.copy_in(channel, phys, count, src);
        }

        self.validity.include(index, end);
        self.publish_flags();
        header.last_accepted.store(end, Release);

        WriteOutcome::Written { overwrote, missed }
    }

    fn copy_in(&self, channel: u32, phys: usize, count: usize, src: &[u8]) {
        let s = self.buf.settings;
        let sample_bytes = s.bytes_per_sample as usize;
        let capacity = s.capacity as usize;
        let row = self.buf.channel_row(channel);

        let first = count.min(capacity - phys);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), row.add(phys * sample_bytes), first * sample_bytes);
            if first < count {
                // Wrapped: the tail of the range restarts at slot zero.
                ptr::copy_nonoverlapping(
                    src.as_ptr().add(first * sample_bytes),
                    row,
                    (count - first) * sample_bytes,
                );
            }
        }
    }

    /// Publish the validity set through the board's seqlock.
    fn publish_flags(&self) {
        let header = self.buf.header(self.board);
        let slots = self.buf.flag_slots(self.board);
        let max = self.buf.settings.flag_ranges as usize;

        let seq = header.flag_seq.load(Relaxed);
        header.flag_seq.store(seq.wrapping_add(1), Relaxed);
        fence(Release);

        let ranges = self.validity.ranges();
        let n = ranges.len().min(max);
        for (i, r) in ranges[..n].iter().enumerate() {
            unsafe { ptr::write_volatile(slots.add(i), *r) };
        }
        header.flag_count.store(n as u32, Relaxed);

        fence(Release);
        header.flag_seq.store(seq.wrapping_add(2), Release);
    }

    /// The writer's own view of the validity set.
    pub fn validity(&self) -> &ValidityRanges {
        &self.validity
    }

    pub fn counters(&self) -> BoardCounters {
        self.buf.counters(self.board)
    }

    /// Bump the invalid-stamp counter for a frame rejected before `write`.
    pub fn count_bad_stamp(&self) {
        self.buf
            .header(self.board)
            .bad_stamp
            .fetch_add(1, Relaxed);
    }
}

impl Drop for BoardWriter<'_> {
    fn drop(&mut self) {
        self.buf
            .header(self.board)
            .writer_claim
            .store(0, Release);
    }
}

impl fmt::Debug for BoardWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardWriter")
            .field("board", &self.board)
            .field("valid_samples", &self.validity.count())
            .finish()
    }
}

/// Samples returned by a read, with their per-sample validity mask.
///
/// `samples` is laid out `[beamlet][time]` like the write side; `mask` has
/// one entry per time sample and applies to every beamlet of the board.
/// Masked-out positions hold unspecified bytes; callers must tolerate holes.
#[derive(Clone, Debug)]
pub struct ReadBlock {
    pub samples: Vec<u8>,
    pub mask: Vec<bool>,
}

impl ReadBlock {
    pub fn fully_valid(&self) -> bool {
        self.mask.iter().all(|&b| b)
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|&&b| b).count()
    }
}

/// Read-only handle for one board.
#[derive(Clone, Copy)]
pub struct BoardReader<'a> {
    buf: &'a SampleBuffer,
    board: u32,
}

impl BoardReader<'_> {
    pub fn board(&self) -> u32 {
        self.board
    }

    /// Read `count` time samples per beamlet starting at `from`. Ranges
    /// outside the validity set are reported through the mask, never as an
    /// error.
    pub fn read(&self, from: TimeStamp, count: usize) -> ReadBlock {
        let s = self.buf.settings;
        assert!(
            count as u64 <= s.capacity,
            "a single read cannot span more than one capacity window"
        );
        let validity = self.buf.snapshot_validity(self.board);
        let mask = validity.mask(from.index(), count);

        let sample_bytes = s.bytes_per_sample as usize;
        let mut samples =
            vec![0u8; count * (s.beamlets_per_board * s.bytes_per_sample) as usize];
        let phys = from.physical(s.capacity) as usize;
        let capacity = s.capacity as usize;

        for beamlet in 0..s.beamlets_per_board {
            let channel = self.board * s.beamlets_per_board + beamlet;
            let row = self.buf.channel_row(channel);
            let dst = &mut samples[beamlet as usize * count * sample_bytes..][..count * sample_bytes];
            let first = count.min(capacity - phys);
            unsafe {
                ptr::copy_nonoverlapping(row.add(phys * sample_bytes), dst.as_mut_ptr(), first * sample_bytes);
                if first < count {
                    ptr::copy_nonoverlapping(
                        row,
                        dst.as_mut_ptr().add(first * sample_bytes),
                        (count - first) * sample_bytes,
                    );
                }
            }
        }

        ReadBlock { samples, mask }
    }

    /// Consistent snapshot of this board's validity set.
    pub fn validity(&self) -> ValidityRanges {
        self.buf.snapshot_validity(self.board)
    }

    pub fn counters(&self) -> BoardCounters {
        self.buf.counters(self.board)
    }
}

impl fmt::Debug for BoardReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardReader")
            .field("board", &self.board)
            .finish()
    }
}
