//! Per-board receive loop.
//!
//! One `PacketReceiver` runs per board, on its own thread, until its
//! cancellation token trips or the transport fails. A transport failure is
//! fatal to that board only: the loop logs it, terminates and the board is
//! considered lost for the rest of the run. There is no reconnect.
//!
//! No logging happens in steady state; loss events are counted and reported
//! once, when the loop exits.

use std::io;

use crate::buffer::ring::{BoardWriter, WriteOutcome};
use crate::cancel::CancelToken;
use crate::frame::{self, FrameLayout};

/// Blocking source of fixed-size frames for one board.
///
/// `recv_frame` fills `buf` with one frame and returns its length. UDP
/// sockets, raw ethernet taps and file replays all fit this shape.
pub trait Transport: Send {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<F> Transport for F
where
    F: FnMut(&mut [u8]) -> io::Result<usize> + Send,
{
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self(buf)
    }
}

/// End-of-run statistics for one board's receive loop.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub board: u32,
    /// Frames pulled off the transport.
    pub received: u64,
    /// Frames written into the ring.
    pub written: u64,
    /// Frames rejected for the unreliable-stamp sentinel.
    pub invalid_stamp: u64,
    /// Frames discarded as late or duplicate.
    pub late: u64,
    /// Frames too short to decode.
    pub malformed: u64,
    /// Samples lost to gaps in the stamp sequence.
    pub missed: u64,
    /// Writes that overwrote still-valid data.
    pub rewritten: u64,
    /// True if the loop ended on a transport failure rather than a stop.
    pub transport_failed: bool,
}

/// The receive-decode-write loop for one board.
pub struct PacketReceiver<'a, T: Transport> {
    transport: T,
    writer: BoardWriter<'a>,
    layout: FrameLayout,
    cancel: CancelToken,
}

impl<'a, T: Transport> PacketReceiver<'a, T> {
    pub fn new(
        transport: T,
        writer: BoardWriter<'a>,
        layout: FrameLayout,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transport,
            writer,
            layout,
            cancel,
        }
    }

    /// Run until cancelled or the transport fails; returns the statistics
    /// report for this board.
    pub fn run(mut self) -> ReceiverStats {
        let board = self.writer.board();
        let mut stats = ReceiverStats {
            board,
            ..ReceiverStats::default()
        };
        let mut buf = vec![0u8; self.layout.frame_size()];
        let samples_per_frame = self.layout.samples_per_frame() as usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let len = match self.transport.recv_frame(&mut buf) {
                Ok(len) => len,
                Err(e) => {
                    log::error!("board {}: transport failed, stopping receive loop: {}", board, e);
                    stats.transport_failed = true;
                    break;
                }
            };
            stats.received += 1;

            let (header, payload) = match frame::decode(&self.layout, &buf[..len]) {
                Ok(decoded) => decoded,
                Err(_) => {
                    stats.malformed += 1;
                    continue;
                }
            };

            if header.stamp_is_unreliable() {
                self.writer.count_bad_stamp();
                stats.invalid_stamp += 1;
                continue;
            }

            let stamp = header.timestamp(&self.layout);
            match self.writer.write(stamp, samples_per_frame, payload) {
                WriteOutcome::Written { .. } => stats.written += 1,
                WriteOutcome::Stale => stats.late += 1,
            }
        }

        let counters = self.writer.counters();
        stats.missed = counters.missed;
        stats.rewritten = counters.rewritten;
        stats.invalid_stamp = counters.bad_stamp;

        log::info!(
            "board {}: receive loop done: {} received, {} written, {} invalid stamp, {} late, {} samples missed, {} rewrites",
            board,
            stats.received,
            stats.written,
            stats.invalid_stamp,
            stats.late,
            stats.missed,
            stats.rewritten
        );
        stats
    }
}
