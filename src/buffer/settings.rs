//! Immutable description of one ring buffer instance.
//!
//! The settings record is written as the first object in the shared arena by
//! the creating process. Attaching processes compute the same record locally
//! and byte-compare it against the stored copy: divergent layout assumptions
//! must fail at startup, never at the first misaligned read.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::frame::FrameLayout;

/// Bit depths boards can be configured for.
pub const KNOWN_BIT_DEPTHS: [u32; 3] = [4, 8, 16];
/// Sample clock rates boards can be configured for, in MHz.
pub const KNOWN_CLOCKS_MHZ: [u32; 2] = [160, 200];

const IDENT_LEN: usize = 32;

/// POD settings record, stored verbatim in shared memory.
///
/// The layout has no internal padding (checked by the layout conformance
/// test), so a byte comparison of two records is well defined.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferSettings {
    /// Board-topology identity, NUL padded ASCII.
    pub topology: [u8; IDENT_LEN],
    /// Antenna-field identity, NUL padded ASCII.
    pub antenna_field: [u8; IDENT_LEN],
    pub bit_depth: u32,
    pub clock_mhz: u32,
    /// Ring capacity in samples per channel.
    pub capacity: u64,
    pub n_boards: u32,
    pub beamlets_per_board: u32,
    /// Time slots per frame; also the block-to-sample conversion factor.
    pub times_per_frame: u32,
    pub subbands_per_frame: u32,
    pub bytes_per_sample: u32,
    /// Maximum validity ranges tracked per board.
    pub flag_ranges: u32,
}

fn ident(s: &str) -> Result<[u8; IDENT_LEN]> {
    let bytes = s.as_bytes();
    if bytes.len() > IDENT_LEN {
        return Err(Error::Config(format!(
            "identity {:?} longer than {} bytes",
            s, IDENT_LEN
        )));
    }
    let mut out = [0u8; IDENT_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn ident_str(raw: &[u8; IDENT_LEN]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(IDENT_LEN);
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

impl BufferSettings {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topology: &str,
        antenna_field: &str,
        bit_depth: u32,
        clock_mhz: u32,
        capacity: u64,
        n_boards: u32,
        beamlets_per_board: u32,
        times_per_frame: u32,
        subbands_per_frame: u32,
        bytes_per_sample: u32,
        flag_ranges: u32,
    ) -> Result<Self> {
        if capacity == 0 || n_boards == 0 || beamlets_per_board == 0 {
            return Err(Error::Config(
                "capacity, board count and beamlets per board must be non-zero".into(),
            ));
        }
        if times_per_frame == 0 || bytes_per_sample == 0 {
            return Err(Error::Config(
                "times per frame and bytes per sample must be non-zero".into(),
            ));
        }
        if flag_ranges == 0 {
            return Err(Error::Config("flag range width must be non-zero".into()));
        }
        // The cleanup pass rediscovers regions by enumerating the known
        // cross-product; a key derived from an unknown value would be lost.
        if !KNOWN_BIT_DEPTHS.contains(&bit_depth) {
            return Err(Error::Config(format!(
                "unknown bit depth {} (known: {:?})",
                bit_depth, KNOWN_BIT_DEPTHS
            )));
        }
        if !KNOWN_CLOCKS_MHZ.contains(&clock_mhz) {
            return Err(Error::Config(format!(
                "unknown clock rate {} MHz (known: {:?})",
                clock_mhz, KNOWN_CLOCKS_MHZ
            )));
        }
        Ok(Self {
            topology: ident(topology)?,
            antenna_field: ident(antenna_field)?,
            bit_depth,
            clock_mhz,
            capacity,
            n_boards,
            beamlets_per_board,
            times_per_frame,
            subbands_per_frame,
            bytes_per_sample,
            flag_ranges,
        })
    }

    pub fn topology(&self) -> &str {
        ident_str(&self.topology)
    }

    pub fn antenna_field(&self) -> &str {
        ident_str(&self.antenna_field)
    }

    /// Total logical channels across all boards.
    pub fn n_channels(&self) -> u32 {
        self.n_boards * self.beamlets_per_board
    }

    /// Bytes of sample storage for one channel's ring.
    pub fn channel_bytes(&self) -> usize {
        self.capacity as usize * self.bytes_per_sample as usize
    }

    /// Shared memory key for this configuration.
    pub fn region_key(&self) -> String {
        region_key_for(self.topology(), self.bit_depth, self.clock_mhz)
    }

    /// Frame layout implied by these settings, given the transport's framing
    /// prefix and header sizes.
    pub fn frame_layout(&self, transport_header: usize, frame_header: usize) -> FrameLayout {
        FrameLayout {
            transport_header,
            frame_header,
            times_per_frame: self.times_per_frame,
            subbands_per_frame: self.subbands_per_frame,
            bytes_per_sample: self.bytes_per_sample,
            samples_per_block: self.times_per_frame,
            blocks_per_epoch: 1 << 16,
        }
    }

    /// Raw bytes of the record, for the attach-time comparison.
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: repr(C) with no internal padding; see the layout test.
        unsafe {
            std::slice::from_raw_parts(
                (self as *const Self).cast::<u8>(),
                std::mem::size_of::<Self>(),
            )
        }
    }
}

/// Derive the shared memory key for a configuration.
///
/// The key is deterministic in (topology, bit depth, clock rate) so that a
/// cleanup pass can rediscover regions left behind by a crashed run without
/// any registry of created configurations.
pub fn region_key_for(topology: &str, bit_depth: u32, clock_mhz: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topology.as_bytes());
    hasher.update(bit_depth.to_le_bytes());
    hasher.update(clock_mhz.to_le_bytes());
    let digest = hasher.finalize();
    let mut suffix = String::with_capacity(16);
    for byte in &digest[..8] {
        suffix.push_str(&format!("{:02x}", byte));
    }
    format!("beamline-{}", suffix)
}

/// Remove every region that could belong to `topology`, across the full
/// cross-product of known bit depths and clock rates. Returns the number of
/// regions actually removed.
pub fn remove_all_regions(topology: &str) -> Result<usize> {
    let mut removed = 0;
    for &bit_depth in &KNOWN_BIT_DEPTHS {
        for &clock_mhz in &KNOWN_CLOCKS_MHZ {
            let key = region_key_for(topology, bit_depth, clock_mhz);
            if crate::core::shm::remove(&key)? {
                log::info!("removed stale shared memory region {}", key);
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_settings() -> BufferSettings {
        BufferSettings::new("CS001", "LBA", 8, 200, 1024, 2, 4, 16, 4, 4, 16).unwrap()
    }

    #[test]
    fn key_depends_on_configuration_only() {
        let a = test_settings();
        let mut b = a;
        b.capacity = 4096;
        assert_eq!(a.region_key(), b.region_key());

        b.bit_depth = 16;
        assert_ne!(a.region_key(), b.region_key());

        assert_eq!(
            a.region_key(),
            region_key_for("CS001", 8, 200),
            "key must be derivable without a settings record"
        );
    }

    #[test]
    fn identity_strings_round_trip() {
        let s = test_settings();
        assert_eq!(s.topology(), "CS001");
        assert_eq!(s.antenna_field(), "LBA");
    }

    #[test]
    fn mutated_settings_compare_unequal_bytewise() {
        let a = test_settings();
        let mut b = a;
        assert_eq!(a.as_bytes(), b.as_bytes());
        b.clock_mhz = 160;
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(BufferSettings::new("T", "F", 8, 200, 0, 1, 1, 16, 1, 4, 4).is_err());
        assert!(BufferSettings::new("T", "F", 8, 200, 64, 1, 1, 16, 1, 4, 0).is_err());
        assert!(BufferSettings::new(
            "a-topology-name-that-is-far-too-long-to-fit",
            "F",
            8,
            200,
            64,
            1,
            1,
            16,
            1,
            4,
            4
        )
        .is_err());
    }

    #[test]
    fn unknown_bit_depth_or_clock_is_rejected() {
        assert!(BufferSettings::new("T", "F", 12, 200, 64, 1, 1, 16, 1, 4, 4).is_err());
        assert!(BufferSettings::new("T", "F", 8, 250, 64, 1, 1, 16, 1, 4, 4).is_err());
    }
}
