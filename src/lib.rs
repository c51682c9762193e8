//! Data-acquisition core for high-rate, multi-board sample streams.
//!
//! Receiver boards emit fixed-size frames at a fixed rate; per-board
//! [`receiver::PacketReceiver`] loops decode them and write into a
//! [`buffer::SampleBuffer`], a time-indexed ring buffer living in a
//! configuration-keyed shared memory arena so that compute processes can
//! attach and consume concurrently. Downstream, an
//! [`aggregator::OutputAggregator`] sums partial results over integration
//! windows and streams finished blocks onward, dropping data only when the
//! real-time deadline leaves no other choice.

pub mod aggregator;
pub mod buffer;
pub mod cancel;
pub mod core;
pub mod error;
pub mod frame;
pub mod receiver;
pub mod report;
pub mod timestamp;

pub use aggregator::{AggregatorConfig, Integrate, OutputAggregator, Sink, WindowStatus};
pub use buffer::{BoardReader, BoardWriter, BufferSettings, SampleBuffer, WriteOutcome};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use frame::{FrameHeader, FrameLayout};
pub use receiver::{PacketReceiver, ReceiverStats, Transport};
pub use timestamp::TimeStamp;
