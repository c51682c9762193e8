// Watching half of the demo pair: attaches read-only to the region the
// `receiver` demo creates and prints the board's validity set and loss
// counters once a second.
use std::io;
use std::time::Duration;

use beamline::buffer::{BufferSettings, SampleBuffer};
use beamline::cancel::CancelToken;

fn demo_settings() -> BufferSettings {
    BufferSettings::new("demo", "HBA0", 8, 200, 4096, 1, 4, 16, 4, 2, 16)
        .expect("demo settings are valid")
}

fn main() -> io::Result<()> {
    env_logger::init();

    let settings = demo_settings();
    println!("Watcher: waiting for region {}...", settings.region_key());

    let buffer = match SampleBuffer::attach(settings, Duration::from_secs(30)) {
        Ok(buffer) => {
            println!("Watcher: attached");
            buffer
        }
        Err(e) => {
            eprintln!("Failed to attach: {}", e);
            return Ok(());
        }
    };

    let cancel = CancelToken::new();
    let cancel_for_handler = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_for_handler.cancel();
    })
    .expect("Error setting Ctrl+C handler");

    let reader = buffer
        .reader(0)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    println!("\n{:<12} {:<12} {:<12} {}", "valid", "missed", "rewritten", "ranges");
    println!("{}", "=".repeat(72));

    while !cancel.is_cancelled() {
        let validity = reader.validity();
        let counters = reader.counters();

        let ranges: Vec<String> = validity
            .ranges()
            .iter()
            .map(|r| format!("[{}, {})", r.start, r.end))
            .collect();
        println!(
            "{:<12} {:<12} {:<12} {}",
            validity.count(),
            counters.missed,
            counters.rewritten,
            ranges.join(" ")
        );

        std::thread::sleep(Duration::from_secs(1));
    }

    println!("Watcher: shutting down");
    Ok(())
}
