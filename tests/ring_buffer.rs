// Ring buffer semantics over a real shared memory region.
// Each test uses its own topology name so regions never collide; a drop
// guard unlinks the region even when an assertion fails.

#![cfg(target_os = "linux")]

use beamline::buffer::{BufferSettings, SampleBuffer, WriteOutcome};
use beamline::timestamp::TimeStamp;

struct RegionGuard(BufferSettings);

impl Drop for RegionGuard {
    fn drop(&mut self) {
        let _ = SampleBuffer::remove(&self.0);
    }
}

fn settings(topology: &str, capacity: u64, beamlets: u32, bytes_per_sample: u32) -> BufferSettings {
    BufferSettings::new(
        topology,
        "HBA0",
        8,
        200,
        capacity,
        1,
        beamlets,
        16,
        beamlets,
        bytes_per_sample,
        16,
    )
    .unwrap()
}

fn payload(count: usize, beamlets: u32, bytes_per_sample: u32, seed: u64) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..count * (beamlets * bytes_per_sample) as usize)
        .map(|_| rng.u8(..))
        .collect()
}

#[test]
fn monotonic_writes_read_back_fully_valid() {
    let s = settings("rb-roundtrip", 256, 2, 4);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();
    let reader = buf.reader(0).unwrap();

    let mut stamp = TimeStamp::from_index(0);
    for i in 0..8u64 {
        let data = payload(16, 2, 4, i);
        assert_eq!(
            writer.write(stamp, 16, &data),
            WriteOutcome::Written {
                overwrote: false,
                missed: 0
            }
        );

        let block = reader.read(stamp, 16);
        assert!(block.fully_valid());
        assert_eq!(block.samples, data);
        stamp += 16;
    }

    let whole = reader.read(TimeStamp::from_index(0), 128);
    assert!(whole.fully_valid());
    let counters = buf.counters(0);
    assert_eq!(counters.missed, 0);
    assert_eq!(counters.rewritten, 0);
}

#[test]
fn stale_write_leaves_buffer_unchanged() {
    let s = settings("rb-stale", 256, 1, 1);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();
    let reader = buf.reader(0).unwrap();

    let data = payload(16, 1, 1, 42);
    writer.write(TimeStamp::from_index(32), 16, &data);

    let before = reader.read(TimeStamp::from_index(32), 16);
    let ranges_before = reader.validity();

    // Behind the accepted write; must be discarded without touching anything.
    let late = payload(16, 1, 1, 43);
    assert_eq!(
        writer.write(TimeStamp::from_index(16), 16, &late),
        WriteOutcome::Stale
    );
    // A duplicate of the accepted stamp is equally stale.
    assert_eq!(
        writer.write(TimeStamp::from_index(32), 16, &late),
        WriteOutcome::Stale
    );

    let after = reader.read(TimeStamp::from_index(32), 16);
    assert_eq!(after.samples, before.samples);
    assert_eq!(reader.validity(), ranges_before);
}

#[test]
fn gap_is_counted_and_left_invalid() {
    let s = settings("rb-gap", 256, 1, 1);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();
    let reader = buf.reader(0).unwrap();

    writer.write(TimeStamp::from_index(0), 16, &payload(16, 1, 1, 1));
    let outcome = writer.write(TimeStamp::from_index(48), 16, &payload(16, 1, 1, 2));
    assert_eq!(
        outcome,
        WriteOutcome::Written {
            overwrote: false,
            missed: 32
        }
    );

    // No synthetic data: the skipped range stays invalid.
    let block = reader.read(TimeStamp::from_index(0), 64);
    let mask = &block.mask;
    assert!(mask[..16].iter().all(|&b| b));
    assert!(mask[16..48].iter().all(|&b| !b));
    assert!(mask[48..].iter().all(|&b| b));
    assert_eq!(buf.counters(0).missed, 32);
}

#[test]
fn overwrite_invalidates_lapped_range_once() {
    let s = settings("rb-overwrite", 128, 1, 1);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();
    let reader = buf.reader(0).unwrap();

    let first = payload(16, 1, 1, 7);
    writer.write(TimeStamp::from_index(0), 16, &first);

    // Same physical slot, one capacity later.
    let second = payload(16, 1, 1, 8);
    let outcome = writer.write(TimeStamp::from_index(128), 16, &second);
    assert_eq!(
        outcome,
        WriteOutcome::Written {
            overwrote: true,
            missed: 112
        }
    );
    assert_eq!(buf.counters(0).rewritten, 1);

    let old = reader.read(TimeStamp::from_index(0), 16);
    assert_eq!(old.valid_count(), 0);
    let new = reader.read(TimeStamp::from_index(128), 16);
    assert!(new.fully_valid());
    assert_eq!(new.samples, second);
}

#[test]
fn multi_lap_gap_still_counts_the_overwrite() {
    let s = settings("rb-multilap", 128, 1, 1);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();
    let reader = buf.reader(0).unwrap();

    let first = payload(16, 1, 1, 9);
    writer.write(TimeStamp::from_index(0), 16, &first);

    // Two full laps ahead: same physical slots as [0, 16).
    let second = payload(16, 1, 1, 10);
    let outcome = writer.write(TimeStamp::from_index(256), 16, &second);
    assert_eq!(
        outcome,
        WriteOutcome::Written {
            overwrote: true,
            missed: 240
        }
    );
    assert_eq!(buf.counters(0).rewritten, 1);

    let old = reader.read(TimeStamp::from_index(0), 16);
    assert_eq!(old.valid_count(), 0);
    let new = reader.read(TimeStamp::from_index(256), 16);
    assert!(new.fully_valid());
    assert_eq!(new.samples, second);
}

#[test]
fn multi_lap_gap_onto_free_slots_is_not_an_overwrite() {
    let s = settings("rb-multilap-miss", 128, 1, 1);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();

    writer.write(TimeStamp::from_index(0), 16, &payload(16, 1, 1, 11));

    // Two laps ahead but offset by one frame: physical slots [16, 32),
    // which never held valid data.
    let outcome = writer.write(TimeStamp::from_index(272), 16, &payload(16, 1, 1, 12));
    assert_eq!(
        outcome,
        WriteOutcome::Written {
            overwrote: false,
            missed: 256
        }
    );
    assert_eq!(buf.counters(0).rewritten, 0);
}

#[test]
fn full_lap_scenario() {
    // capacity 1024, frames of 16 samples: 64 frames at stamps 0,16,..,1008
    // fill the buffer exactly once; the next frame at 1024 overwrites [0,16).
    let s = settings("rb-lap", 1024, 1, 1);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();
    let reader = buf.reader(0).unwrap();

    let mut stamp = TimeStamp::from_index(0);
    for i in 0..64u64 {
        let outcome = writer.write(stamp, 16, &payload(16, 1, 1, i));
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                overwrote: false,
                missed: 0
            }
        );
        stamp += 16;
    }
    assert!(reader.read(TimeStamp::from_index(0), 1024).fully_valid());
    assert_eq!(buf.counters(0).rewritten, 0);

    let outcome = writer.write(stamp, 16, &payload(16, 1, 1, 64));
    assert_eq!(
        outcome,
        WriteOutcome::Written {
            overwrote: true,
            missed: 0
        }
    );
    assert_eq!(buf.counters(0).rewritten, 1);

    let head = reader.read(TimeStamp::from_index(0), 16);
    assert_eq!(head.valid_count(), 0);
    let tail = reader.read(TimeStamp::from_index(16), 1024);
    assert!(tail.fully_valid());
}

#[test]
fn writer_handle_is_exclusive() {
    let s = settings("rb-claim", 128, 1, 1);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();

    let writer = buf.writer(0).unwrap();
    assert!(buf.writer(0).is_err(), "second writer for the same board must fail");

    drop(writer);
    let again = buf.writer(0);
    assert!(again.is_ok(), "dropping the handle releases the claim");
}

#[test]
fn readers_duplicate_freely() {
    let s = settings("rb-readers", 128, 2, 2);
    let _guard = RegionGuard(s);
    let buf = SampleBuffer::create(s).unwrap();
    let mut writer = buf.writer(0).unwrap();

    let r1 = buf.reader(0).unwrap();
    let r2 = r1;
    let data = payload(16, 2, 2, 5);
    writer.write(TimeStamp::from_index(0), 16, &data);

    assert_eq!(r1.read(TimeStamp::from_index(0), 16).samples, data);
    assert_eq!(r2.read(TimeStamp::from_index(0), 16).samples, data);
}
