// The receive-decode-write loop against a scripted transport: ordinary
// frames, the unreliable-stamp sentinel, late duplicates, gaps, short
// frames and a transport failure, all in one pass.

#![cfg(target_os = "linux")]

use std::collections::VecDeque;
use std::io;

use beamline::buffer::{BufferSettings, SampleBuffer};
use beamline::cancel::CancelToken;
use beamline::frame::{self, FrameHeader, FrameLayout};
use beamline::receiver::PacketReceiver;
use beamline::timestamp::TimeStamp;

struct RegionGuard(BufferSettings);

impl Drop for RegionGuard {
    fn drop(&mut self) {
        let _ = SampleBuffer::remove(&self.0);
    }
}

fn settings(topology: &str) -> BufferSettings {
    // 1 board, 2 beamlets, 16 time slots per frame, 1 byte per sample.
    BufferSettings::new(topology, "HBA0", 8, 200, 256, 1, 2, 16, 2, 1, 16).unwrap()
}

/// A well-formed frame at `block`, payload filled with `fill`.
fn make_frame(layout: &FrameLayout, epoch: u32, block: u32, fill: u8) -> Vec<u8> {
    let mut raw = vec![fill; layout.frame_size()];
    frame::encode_header(layout, &FrameHeader { board: 0, epoch, block }, &mut raw);
    raw
}

/// Transport that replays a script of frames, then fails.
fn scripted(mut script: VecDeque<Vec<u8>>) -> impl FnMut(&mut [u8]) -> io::Result<usize> + Send {
    move |buf: &mut [u8]| match script.pop_front() {
        Some(bytes) => {
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }
        None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down")),
    }
}

#[test]
fn loop_classifies_every_frame_and_stops_on_transport_failure() {
    let s = settings("recv-loop");
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let layout = s.frame_layout(0, 16);

    let script: VecDeque<Vec<u8>> = VecDeque::from(vec![
        make_frame(&layout, 0, 0, 0x10),
        make_frame(&layout, 0, 1, 0x11),
        // Stamp sentinel: must be rejected before any write.
        make_frame(&layout, 0xFFFF, 2, 0x12),
        // Duplicate of the accepted block 1.
        make_frame(&layout, 0, 1, 0x13),
        // Truncated on the wire.
        make_frame(&layout, 0, 3, 0x14)[..10].to_vec(),
        // Two blocks skipped: 32 samples missed.
        make_frame(&layout, 0, 4, 0x15),
    ]);

    let writer = buf.writer(0).unwrap();
    let receiver = PacketReceiver::new(scripted(script), writer, layout, CancelToken::new());
    let stats = receiver.run();

    assert_eq!(stats.board, 0);
    assert_eq!(stats.received, 6);
    assert_eq!(stats.written, 3);
    assert_eq!(stats.invalid_stamp, 1);
    assert_eq!(stats.late, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.missed, 32);
    assert_eq!(stats.rewritten, 0);
    assert!(stats.transport_failed);

    // Blocks 0, 1 and 4 landed; the gap in between stays invalid.
    let reader = buf.reader(0).unwrap();
    let block = reader.read(TimeStamp::from_index(0), 80);
    assert!(block.mask[..32].iter().all(|&b| b));
    assert!(block.mask[32..64].iter().all(|&b| !b));
    assert!(block.mask[64..].iter().all(|&b| b));
    // Samples come back [beamlet][time]: beamlet 0 in [0, 80), beamlet 1
    // in [80, 160).
    assert!(block.samples[..16].iter().all(|&v| v == 0x10));
    assert!(block.samples[16..32].iter().all(|&v| v == 0x11));
    assert!(block.samples[64..80].iter().all(|&v| v == 0x15));
    assert!(block.samples[80..96].iter().all(|&v| v == 0x10));
    assert!(block.samples[144..160].iter().all(|&v| v == 0x15));

    let counters = buf.counters(0);
    assert_eq!(counters.missed, 32);
    assert_eq!(counters.bad_stamp, 1);
}

#[test]
fn cancellation_stops_a_healthy_loop() {
    let s = settings("recv-cancel");
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let layout = s.frame_layout(0, 16);

    // An endless transport that trips the token after three frames; the
    // loop must notice before the fourth receive.
    let cancel = CancelToken::new();
    let transport = {
        let cancel = cancel.clone();
        let mut block = 0u32;
        move |out: &mut [u8]| -> io::Result<usize> {
            let raw = make_frame(&layout, 0, block, block as u8);
            block += 1;
            if block == 3 {
                cancel.cancel();
            }
            out[..raw.len()].copy_from_slice(&raw);
            Ok(raw.len())
        }
    };

    let writer = buf.writer(0).unwrap();
    let receiver = PacketReceiver::new(transport, writer, layout, cancel);
    let stats = receiver.run();

    assert!(!stats.transport_failed);
    assert_eq!(stats.received, 3);
    assert_eq!(stats.written, 3);
    assert!(buf.reader(0).unwrap().read(TimeStamp::from_index(0), 48).fully_valid());
}
