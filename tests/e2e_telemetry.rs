//! End-to-end tests for the seqlock telemetry channel under a live writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use boxgraph::telemetry::{channel, TelemetryBuffer};
use boxgraph::{TelemetryReader, TelemetryRecord, TelemetryWriter, TransportRecord};

/// Every word is derived from `n`, so a torn read shows up as words that
/// disagree with each other.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Probe {
    n: u64,
    square: u64,
    inverted: u64,
    tag: u64,
}

impl Probe {
    fn new(n: u64) -> Self {
        Self { n, square: n.wrapping_mul(n), inverted: !n, tag: n ^ 0xA5A5_A5A5_A5A5_A5A5 }
    }

    fn is_consistent(&self) -> bool {
        *self == Probe::new(self.n)
    }
}

impl TelemetryRecord for Probe {
    const VERSION: u32 = 7;
    const WORDS: usize = 4;

    fn encode(&self, words: &mut [u64]) {
        words.copy_from_slice(&[self.n, self.square, self.inverted, self.tag]);
    }

    fn decode(words: &[u64]) -> Self {
        Self { n: words[0], square: words[1], inverted: words[2], tag: words[3] }
    }
}

#[test]
fn test_reader_never_sees_torn_records() {
    const WRITES: u64 = 200_000;
    let (mut writer, mut reader) = channel::<Probe>();
    let done = Arc::new(AtomicBool::new(false));

    let writer_done = Arc::clone(&done);
    let handle = thread::spawn(move || {
        for n in 1..=WRITES {
            writer.publish(&Probe::new(n));
        }
        writer_done.store(true, Ordering::Release);
    });

    let mut last = 0u64;
    while !done.load(Ordering::Acquire) {
        if let Some(probe) = reader.poll() {
            assert!(probe.is_consistent(), "torn read: {probe:?}");
            assert!(probe.n > last, "went backwards: {} after {last}", probe.n);
            last = probe.n;
        }
    }
    handle.join().unwrap();

    let (seq, final_probe) = reader.read().unwrap();
    assert_eq!(final_probe, Probe::new(WRITES));
    assert_eq!(seq, WRITES * 2);
}

#[test]
fn test_many_readers_one_writer() {
    let buffer = TelemetryBuffer::for_record::<TransportRecord>();
    let mut writer = TelemetryWriter::<TransportRecord>::attach(Arc::clone(&buffer)).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let mut reader = TelemetryReader::<TransportRecord>::attach(Arc::clone(&buffer)).unwrap();
            thread::spawn(move || {
                let mut seen = 0u64;
                while seen < 1_000 {
                    if let Some((_, record)) = reader.read() {
                        // block and position are published together
                        assert_eq!(record.position, record.block as f64 * 128.0);
                        assert_eq!(record.playing, record.block % 2 == 0);
                        seen = seen.max(record.block);
                    }
                }
            })
        })
        .collect();

    let mut block = 0u64;
    while readers.iter().any(|r| !r.is_finished()) {
        block += 1;
        writer.publish(&TransportRecord { position: block as f64 * 128.0, playing: block % 2 == 0, block });
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(buffer.writes(), block);
}
