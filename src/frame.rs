//! Fixed-size frame decoding.
//!
//! A frame is one transport record for one board at one point in time. It is
//! transient: it lives for a single receive-decode-write cycle and never
//! enters the shared buffer as-is. The layout is fixed per stream:
//!
//! ```text
//! [0, transport_header)            optional link-layer prefix
//! [transport_header, +header_len)  frame header (counters live here)
//! [.., frame size)                 samples, one record per
//!                                  (subband, time-slot) pair
//! ```
//!
//! Within the frame header, the epoch counter is a little-endian u32 at
//! offset 8 and the block counter a little-endian u32 at offset 12. These
//! offsets must match the producing firmware.

use crate::error::{Error, Result};
use crate::timestamp::{epoch_is_unreliable, TimeStamp};

/// Byte offset of the epoch counter within the frame header.
pub const EPOCH_OFFSET: usize = 8;
/// Byte offset of the block counter within the frame header.
pub const BLOCK_OFFSET: usize = 12;
/// Byte offset of the board identifier within the frame header.
pub const BOARD_OFFSET: usize = 0;

/// Static description of the frame layout for one stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    /// Size of the optional transport prefix (0 if the transport strips it).
    pub transport_header: usize,
    /// Size of the frame header; samples start right after it.
    pub frame_header: usize,
    /// Time slots carried per frame.
    pub times_per_frame: u32,
    /// Sub-channels carried per frame.
    pub subbands_per_frame: u32,
    /// Bytes per sample record.
    pub bytes_per_sample: u32,
    /// Conversion factor from block counter to sample index.
    pub samples_per_block: u32,
    /// Blocks spanned by one epoch counter tick.
    pub blocks_per_epoch: u32,
}

impl FrameLayout {
    /// Total byte size of one frame on the wire.
    pub fn frame_size(&self) -> usize {
        self.transport_header + self.frame_header + self.payload_size()
    }

    /// Byte size of the sample payload.
    pub fn payload_size(&self) -> usize {
        (self.times_per_frame * self.subbands_per_frame * self.bytes_per_sample) as usize
    }

    /// Samples (time slots) a frame advances the stream by.
    pub fn samples_per_frame(&self) -> u64 {
        u64::from(self.times_per_frame)
    }
}

/// Decoded frame header fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub board: u32,
    pub epoch: u32,
    pub block: u32,
}

impl FrameHeader {
    /// True if the epoch counter carries the unreliable-stamp sentinel.
    pub fn stamp_is_unreliable(&self) -> bool {
        epoch_is_unreliable(self.epoch)
    }

    /// Sample index this frame claims to start at.
    pub fn timestamp(&self, layout: &FrameLayout) -> TimeStamp {
        TimeStamp::from_counters(
            self.epoch,
            self.block,
            layout.samples_per_block,
            layout.blocks_per_epoch,
        )
    }
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Split a raw frame into its decoded header and payload slice.
///
/// Short frames are a decode error; the caller discards them without writing.
pub fn decode<'a>(layout: &FrameLayout, raw: &'a [u8]) -> Result<(FrameHeader, &'a [u8])> {
    if layout.frame_header < BLOCK_OFFSET + 4 {
        return Err(Error::Frame(format!(
            "frame header of {} bytes cannot hold the counter fields",
            layout.frame_header
        )));
    }
    let expected = layout.frame_size();
    if raw.len() < expected {
        return Err(Error::Frame(format!(
            "short frame: got {} bytes, expected {}",
            raw.len(),
            expected
        )));
    }

    let header = &raw[layout.transport_header..];
    let decoded = FrameHeader {
        board: read_u32_le(header, BOARD_OFFSET),
        epoch: read_u32_le(header, EPOCH_OFFSET),
        block: read_u32_le(header, BLOCK_OFFSET),
    };

    let payload_start = layout.transport_header + layout.frame_header;
    let payload = &raw[payload_start..payload_start + layout.payload_size()];
    Ok((decoded, payload))
}

/// Encode a frame header into `raw`. Used by tests and by file-based replay
/// transports; real boards produce these frames in firmware.
pub fn encode_header(layout: &FrameLayout, header: &FrameHeader, raw: &mut [u8]) {
    let base = layout.transport_header;
    raw[base + BOARD_OFFSET..base + BOARD_OFFSET + 4].copy_from_slice(&header.board.to_le_bytes());
    raw[base + EPOCH_OFFSET..base + EPOCH_OFFSET + 4].copy_from_slice(&header.epoch.to_le_bytes());
    raw[base + BLOCK_OFFSET..base + BLOCK_OFFSET + 4].copy_from_slice(&header.block.to_le_bytes());
}
