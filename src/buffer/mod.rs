pub mod layout;
pub mod ring;
pub mod settings;
pub mod validity;

pub use layout::{BoardCounters, BoardHeader, FlagRange};
pub use ring::{BoardReader, BoardWriter, ReadBlock, SampleBuffer, WriteOutcome};
pub use settings::{remove_all_regions, region_key_for, BufferSettings};
pub use validity::{SampleRange, ValidityRanges};
