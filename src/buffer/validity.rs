//! Validity bookkeeping for one board.
//!
//! A `ValidityRanges` is a sorted set of non-overlapping `[start, end)`
//! intervals over the logical sample index space. The interval arithmetic is
//! kept pure (no shared memory, no atomics) so it can be tested in
//! isolation; the ring buffer publishes snapshots of it through a per-board
//! seqlock.

use crate::buffer::layout::FlagRange;

/// Half-open interval of logical sample indices.
pub type SampleRange = FlagRange;

impl FlagRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Sorted set of non-overlapping valid sample ranges, bounded in size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidityRanges {
    ranges: Vec<SampleRange>,
    max_ranges: usize,
}

impl ValidityRanges {
    /// `max_ranges` is the flag-range width of the buffer: the most intervals
    /// that can be tracked (and published to shared memory) at once.
    pub fn new(max_ranges: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(max_ranges),
            max_ranges,
        }
    }

    pub fn ranges(&self) -> &[SampleRange] {
        &self.ranges
    }

    pub fn max_ranges(&self) -> usize {
        self.max_ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of valid samples.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(SampleRange::len).sum()
    }

    /// Mark `[start, end)` valid, coalescing with touching neighbours.
    ///
    /// If the set would exceed its bound, the oldest interval is dropped:
    /// recency always wins over history, matching the overwrite policy of
    /// the ring itself.
    pub fn include(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = SampleRange::new(start, end);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in &self.ranges {
            if r.end < merged.start || r.start > merged.end {
                if !placed && r.start > merged.end {
                    out.push(merged);
                    placed = true;
                }
                out.push(*r);
            } else {
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        if out.len() > self.max_ranges {
            out.remove(0);
        }
        self.ranges = out;
    }

    /// Mark `[start, end)` invalid, splitting intervals where needed.
    pub fn exclude(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for r in &self.ranges {
            if r.end <= start || r.start >= end {
                out.push(*r);
                continue;
            }
            if r.start < start {
                out.push(SampleRange::new(r.start, start));
            }
            if r.end > end {
                out.push(SampleRange::new(end, r.end));
            }
        }
        if out.len() > self.max_ranges {
            let excess = out.len() - self.max_ranges;
            out.drain(..excess);
        }
        self.ranges = out;
    }

    /// Drop everything below `min`: those indices have been lapped by the
    /// writer and no longer name live data.
    pub fn trim_before(&mut self, min: u64) {
        self.exclude(0, min);
    }

    /// Number of samples in `[start, end)` that are currently valid.
    pub fn overlap(&self, start: u64, end: u64) -> u64 {
        self.ranges
            .iter()
            .map(|r| {
                let s = r.start.max(start);
                let e = r.end.min(end);
                e.saturating_sub(s)
            })
            .sum()
    }

    pub fn is_valid(&self, index: u64) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start <= index && index < r.end)
    }

    /// Per-sample validity mask for `[start, start + count)`.
    pub fn mask(&self, start: u64, count: usize) -> Vec<bool> {
        let mut mask = vec![false; count];
        for r in &self.ranges {
            let lo = r.start.max(start);
            let hi = r.end.min(start + count as u64);
            for i in lo..hi {
                mask[(i - start) as usize] = true;
            }
        }
        mask
    }

    /// Copy the set into shared flag slots. Returns the published count.
    pub fn store(&self, slots: &mut [SampleRange]) -> usize {
        let n = self.ranges.len().min(slots.len());
        slots[..n].copy_from_slice(&self.ranges[..n]);
        n
    }

    /// Rebuild a set from shared flag slots.
    pub fn load(slots: &[SampleRange], max_ranges: usize) -> Self {
        let mut v = Self::new(max_ranges);
        for r in slots {
            v.include(r.start, r.end);
        }
        v
    }
}
