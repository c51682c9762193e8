// Receiving half of the demo pair: creates the shared buffer for the demo
// configuration and feeds it from a synthetic transport that behaves like a
// slightly lossy board link. Run `watcher` in a second terminal to observe
// the buffer filling up.
use std::env;
use std::io;

use beamline::buffer::{BufferSettings, SampleBuffer};
use beamline::cancel::CancelToken;
use beamline::frame::{self, FrameHeader};
use beamline::receiver::PacketReceiver;

fn demo_settings() -> BufferSettings {
    BufferSettings::new("demo", "HBA0", 8, 200, 4096, 1, 4, 16, 4, 2, 16)
        .expect("demo settings are valid")
}

fn main() -> io::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_frames>", args[0]);
        std::process::exit(1);
    }
    let num_frames: u32 = args[1].parse().expect("Invalid number of frames");

    let settings = demo_settings();
    let buffer = SampleBuffer::create(settings)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    println!("Receiver: created region {}", settings.region_key());

    let cancel = CancelToken::new();
    let cancel_for_handler = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_for_handler.cancel();
    })
    .expect("Error setting Ctrl+C handler");

    // Synthetic link: steady frames with an occasional gap and an occasional
    // unreliable stamp, paced at roughly 10k frames/sec.
    let layout = settings.frame_layout(0, 16);
    let mut block = 0u32;
    let mut produced = 0u32;
    let transport = move |out: &mut [u8]| -> io::Result<usize> {
        if produced >= num_frames {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "demo stream done"));
        }
        produced += 1;

        let epoch = if produced % 97 == 0 { 0xFFFF } else { 0 };
        if produced % 50 == 0 {
            block += 1; // dropped frame: the stamp sequence skips a block
        }

        let mut raw = vec![0u8; layout.frame_size()];
        frame::encode_header(&layout, &FrameHeader { board: 0, epoch, block }, &mut raw);
        let mut rng = fastrand::Rng::with_seed(u64::from(block));
        for byte in &mut raw[16..] {
            *byte = rng.u8(..);
        }
        block += 1;

        std::thread::sleep(std::time::Duration::from_micros(100));
        out[..raw.len()].copy_from_slice(&raw);
        Ok(raw.len())
    };

    println!("Receiver: streaming {} frames (Ctrl+C to stop early)...", num_frames);
    let start = std::time::Instant::now();

    let writer = buffer
        .writer(0)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let stats = PacketReceiver::new(transport, writer, layout, cancel).run();

    let elapsed = start.elapsed();
    println!("Receiver: done in {:.2?}", elapsed);
    println!(
        "Receiver: {} received, {} written, {} invalid stamp, {} late, {} samples missed",
        stats.received, stats.written, stats.invalid_stamp, stats.late, stats.missed
    );
    println!(
        "Receiver: {:.2} frames/sec",
        stats.received as f64 / elapsed.as_secs_f64()
    );

    // Give attached watchers a moment before the region disappears.
    println!("Receiver: region stays up for 5 seconds...");
    std::thread::sleep(std::time::Duration::from_secs(5));
    SampleBuffer::remove(&settings)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    println!("Receiver: region removed");

    Ok(())
}
