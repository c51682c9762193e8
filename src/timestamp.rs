// Board timestamps arrive as an (epoch counter, block counter) pair. All
// buffer addressing works on the single monotonic sample index derived from
// that pair, so the conversion lives in one place.

use std::fmt;
use std::ops::AddAssign;

/// Sentinel in the low 16 bits of the epoch counter marking a frame's
/// timestamp as untrustworthy. Such frames never enter the buffer.
pub const UNRELIABLE_EPOCH_SENTINEL: u32 = 0xFFFF;

/// A monotonically increasing logical sample index.
///
/// The index never wraps within one acquisition run; wrapping only applies to
/// the physical addressing of the ring buffer, never to the logical index.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct TimeStamp(u64);

impl TimeStamp {
    /// Convert a board-reported (epoch, block) counter pair into a sample
    /// index. `samples_per_block` is the fixed conversion factor of the
    /// stream; `blocks_per_epoch` is how many blocks one epoch tick spans.
    pub fn from_counters(
        epoch: u32,
        block: u32,
        samples_per_block: u32,
        blocks_per_epoch: u32,
    ) -> Self {
        let blocks = u64::from(epoch) * u64::from(blocks_per_epoch) + u64::from(block);
        TimeStamp(blocks * u64::from(samples_per_block))
    }

    pub fn from_index(index: u64) -> Self {
        TimeStamp(index)
    }

    pub fn index(self) -> u64 {
        self.0
    }

    /// Advance the stamp by `n_samples`.
    pub fn advance(&mut self, n_samples: u64) {
        self.0 += n_samples;
    }

    /// Physical slot for this stamp in a buffer of `capacity` samples.
    pub fn physical(self, capacity: u64) -> u64 {
        self.0 % capacity
    }
}

impl AddAssign<u64> for TimeStamp {
    fn add_assign(&mut self, n_samples: u64) {
        self.advance(n_samples);
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// True if an epoch counter carries the unreliable-stamp sentinel.
pub fn epoch_is_unreliable(epoch: u32) -> bool {
    epoch & 0xFFFF == UNRELIABLE_EPOCH_SENTINEL
}
