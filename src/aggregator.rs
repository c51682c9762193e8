//! Output aggregation: sum per-step contributions from many compute workers
//! into integration windows and hand finished blocks to per-channel sender
//! threads.
//!
//! Every channel owns a bounded pair of queues: `free` holds pre-allocated
//! result buffers, `send` holds completed blocks awaiting transmission. The
//! sender thread drains `send` in FIFO order and returns each buffer to
//! `free` once written downstream. When no free buffer exists at the close
//! of a window, real-time mode drops the window and non-real-time mode blocks. Dropping
//! here is the only place the system discards data on purpose.

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::report::{ReportAction, StreakReporter};

/// A payload that can be summed across an integration window.
pub trait Integrate {
    /// Overwrite `self` with `src`.
    fn assign(&mut self, src: &Self);
    /// Add `src` into `self`.
    fn accumulate(&mut self, src: &Self);
}

impl Integrate for Vec<f32> {
    fn assign(&mut self, src: &Self) {
        self.clear();
        self.extend_from_slice(src);
    }

    fn accumulate(&mut self, src: &Self) {
        debug_assert_eq!(self.len(), src.len());
        for (a, b) in self.iter_mut().zip(src) {
            *a += b;
        }
    }
}

/// Downstream destination for completed blocks. Closures work too.
pub trait Sink<B>: Send {
    fn write_block(&mut self, seq: u64, block: &B) -> io::Result<()>;
}

impl<B, F> Sink<B> for F
where
    F: FnMut(u64, &B) -> io::Result<()> + Send,
{
    fn write_block(&mut self, seq: u64, block: &B) -> io::Result<()> {
        self(seq, block)
    }
}

/// Configuration for one aggregator instance.
#[derive(Copy, Clone, Debug)]
pub struct AggregatorConfig {
    /// Steps summed per integration window.
    pub steps_per_integration: usize,
    /// Drop on overload instead of blocking on the free queue.
    pub real_time: bool,
    /// Logical output channels.
    pub n_channels: usize,
    /// Depth of each channel's free and send queues; must be > 0.
    pub queue_depth: usize,
}

/// What happened to the window after one contribution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WindowStatus {
    /// More steps to come.
    Pending,
    /// Window closed and queued for sending under this sequence number.
    Dispatched(u64),
    /// Window closed but discarded: no free buffer in real-time mode, or the
    /// channel's sender is gone.
    Dropped,
}

enum SendItem<B> {
    Block { seq: u64, block: B },
    /// No more data; closes the sender thread.
    Done,
}

struct ChannelState<B> {
    acc: B,
    expected_step: usize,
    next_seq: u64,
    dispatched: u64,
    free_rx: Receiver<B>,
    send_tx: Sender<SendItem<B>>,
    reporter: StreakReporter,
    handle: Option<JoinHandle<u64>>,
}

/// End-of-run summary for one output channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelSummary {
    pub channel: usize,
    /// Windows queued to the sender.
    pub dispatched: u64,
    /// Windows discarded under overload.
    pub dropped: u64,
    /// Blocks actually written downstream.
    pub written: u64,
}

pub struct OutputAggregator<B: Integrate + Send + 'static> {
    cfg: AggregatorConfig,
    channels: Vec<ChannelState<B>>,
}

impl<B: Integrate + Send + 'static> OutputAggregator<B> {
    /// Build the aggregator, pre-filling every channel's free queue with
    /// `queue_depth` buffers from `make_buffer` and spawning one sender
    /// thread per channel around the sink from `make_sink`.
    pub fn new<S, MkBuf, MkSink>(
        cfg: AggregatorConfig,
        mut make_buffer: MkBuf,
        mut make_sink: MkSink,
    ) -> Result<Self>
    where
        S: Sink<B> + 'static,
        MkBuf: FnMut() -> B,
        MkSink: FnMut(usize) -> S,
    {
        if cfg.queue_depth == 0 {
            return Err(Error::Config("queue depth must be > 0".into()));
        }
        if cfg.steps_per_integration == 0 {
            return Err(Error::Config("steps per integration must be > 0".into()));
        }

        let mut channels = Vec::with_capacity(cfg.n_channels);
        for channel in 0..cfg.n_channels {
            let (free_tx, free_rx) = bounded(cfg.queue_depth);
            for _ in 0..cfg.queue_depth {
                let _ = free_tx.send(make_buffer());
            }
            let (send_tx, send_rx) = bounded::<SendItem<B>>(cfg.queue_depth);

            let sink = make_sink(channel);
            let handle = thread::Builder::new()
                .name(format!("beamline-sender-{}", channel))
                .spawn(move || sender_loop(channel, send_rx, free_tx, sink))?;

            channels.push(ChannelState {
                acc: make_buffer(),
                expected_step: 0,
                next_seq: 0,
                dispatched: 0,
                free_rx,
                send_tx,
                reporter: StreakReporter::new(),
                handle: Some(handle),
            });
        }

        Ok(Self { cfg, channels })
    }

    /// Feed one compute worker's contribution for `(channel, step)`.
    ///
    /// Steps must arrive in order 0..N-1 per channel; an out-of-order step is
    /// a precondition violation, not a recoverable case.
    pub fn add_contribution(&mut self, channel: usize, step: usize, data: &B) -> Result<WindowStatus> {
        let steps = self.cfg.steps_per_integration;
        let st = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| Error::Config(format!("channel {} out of range", channel)))?;

        if step != st.expected_step {
            return Err(Error::StepOrder {
                channel,
                got: step,
                expected: st.expected_step,
            });
        }

        if step == 0 {
            st.acc.assign(data);
        } else {
            st.acc.accumulate(data);
        }

        if step + 1 < steps {
            st.expected_step = step + 1;
            return Ok(WindowStatus::Pending);
        }

        // Window closed: dispatch or drop, then start clean.
        st.expected_step = 0;
        let seq = st.next_seq;
        st.next_seq += 1;

        let buffer = if self.cfg.real_time {
            st.free_rx.try_recv().ok()
        } else {
            st.free_rx.recv().ok()
        };

        let Some(mut block) = buffer else {
            if st.reporter.record_loss() == ReportAction::StreakStarted {
                log::warn!(
                    "channel {}: no free output buffer, dropping integration windows",
                    channel
                );
            }
            return Ok(WindowStatus::Dropped);
        };

        block.assign(&st.acc);
        if st.send_tx.send(SendItem::Block { seq, block }).is_err() {
            // Sender thread is gone (downstream failure); the channel is lost.
            if st.reporter.record_loss() == ReportAction::StreakStarted {
                log::warn!("channel {}: sender terminated, dropping integration windows", channel);
            }
            return Ok(WindowStatus::Dropped);
        }

        st.dispatched += 1;
        if let ReportAction::StreakEnded { dropped } = st.reporter.record_delivery() {
            log::info!(
                "channel {}: delivering again after dropping {} integration windows",
                channel,
                dropped
            );
        }
        Ok(WindowStatus::Dispatched(seq))
    }

    /// Windows dropped so far on `channel`.
    pub fn dropped(&self, channel: usize) -> u64 {
        self.channels[channel].reporter.total()
    }

    /// Push the end-of-data sentinel to every sender and collect summaries.
    pub fn finish(mut self) -> Vec<ChannelSummary> {
        let mut summaries = Vec::with_capacity(self.channels.len());
        for (channel, st) in self.channels.iter_mut().enumerate() {
            let _ = st.send_tx.send(SendItem::Done);
            let written = st
                .handle
                .take()
                .and_then(|h| h.join().ok())
                .unwrap_or(0);
            let dropped = st.reporter.total();
            if dropped > 0 {
                log::info!(
                    "channel {}: {} windows dropped over {} streaks this run",
                    channel,
                    dropped,
                    st.reporter.streaks()
                );
            }
            summaries.push(ChannelSummary {
                channel,
                dispatched: st.dispatched,
                dropped,
                written,
            });
        }
        summaries
    }
}

fn sender_loop<B, S: Sink<B>>(
    channel: usize,
    send_rx: Receiver<SendItem<B>>,
    free_tx: Sender<B>,
    mut sink: S,
) -> u64 {
    let mut written = 0;
    while let Ok(item) = send_rx.recv() {
        match item {
            SendItem::Block { seq, block } => {
                if let Err(e) = sink.write_block(seq, &block) {
                    log::error!(
                        "channel {}: downstream write failed, stopping sender: {}",
                        channel,
                        e
                    );
                    return written;
                }
                written += 1;
                // Every buffer cycles between the two bounded queues, so this
                // send cannot block.
                let _ = free_tx.send(block);
            }
            SendItem::Done => break,
        }
    }
    written
}
