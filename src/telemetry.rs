//! Lock-free telemetry from the audio thread to the UI.
//!
//! A seqlock over a fixed array of `AtomicU64` words. One writer, readers
//! that retry instead of blocking it. The sequence word is odd while a
//! write is in progress; a read is accepted only if the sequence was even
//! and unchanged across the whole read, so a reader never sees a record
//! half old and half new.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::{Error, Result};

/// Read attempts before `read` gives up for this frame.
const MAX_READ_RETRIES: usize = 64;

/// A fixed-width record that fits in `WORDS` 64-bit words.
pub trait TelemetryRecord: Sized {
    /// Layout version; writer and reader must agree.
    const VERSION: u32;
    const WORDS: usize;

    fn encode(&self, words: &mut [u64]);
    fn decode(words: &[u64]) -> Self;
}

// ============================================================================
// Shared buffer
// ============================================================================

#[derive(Debug)]
#[repr(align(64))]
struct Sequence(AtomicU64);

/// Shared memory between one writer and its readers.
#[derive(Debug)]
pub struct TelemetryBuffer {
    seq: Sequence,
    /// `version << 32 | words`
    layout: AtomicU64,
    words: Box<[AtomicU64]>,
    writer_attached: AtomicBool,
}

fn layout_word(version: u32, words: usize) -> u64 {
    (u64::from(version) << 32) | words as u64
}

impl TelemetryBuffer {
    pub fn with_layout(version: u32, words: usize) -> Arc<Self> {
        Arc::new(Self {
            seq: Sequence(AtomicU64::new(0)),
            layout: AtomicU64::new(layout_word(version, words)),
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            writer_attached: AtomicBool::new(false),
        })
    }

    pub fn for_record<R: TelemetryRecord>() -> Arc<Self> {
        Self::with_layout(R::VERSION, R::WORDS)
    }

    /// Number of completed writes.
    pub fn writes(&self) -> u64 {
        self.seq.0.load(Ordering::Acquire) / 2
    }

    fn check_layout<R: TelemetryRecord>(&self) -> Result<()> {
        let found = self.layout.load(Ordering::Acquire);
        let expected = layout_word(R::VERSION, R::WORDS);
        if found != expected || self.words.len() != R::WORDS {
            warn!(found, expected, "telemetry layout skew");
            return Err(Error::TelemetryLayout(format!(
                "buffer is v{} x{} words, record is v{} x{} words",
                found >> 32,
                found & 0xFFFF_FFFF,
                R::VERSION,
                R::WORDS
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

/// The single writer. Never blocks, never allocates after construction.
pub struct TelemetryWriter<R> {
    buffer: Arc<TelemetryBuffer>,
    scratch: Vec<u64>,
    _record: PhantomData<fn(&R)>,
}

impl<R: TelemetryRecord> TelemetryWriter<R> {
    /// Attach to `buffer`. Fails on a layout mismatch or if another writer
    /// is attached.
    pub fn attach(buffer: Arc<TelemetryBuffer>) -> Result<Self> {
        buffer.check_layout::<R>()?;
        if buffer.writer_attached.swap(true, Ordering::AcqRel) {
            return Err(Error::TelemetryLayout("a writer is already attached".into()));
        }
        Ok(Self { buffer, scratch: vec![0; R::WORDS], _record: PhantomData })
    }

    pub fn publish(&mut self, record: &R) {
        record.encode(&mut self.scratch);
        let seq = &self.buffer.seq.0;
        let start = seq.load(Ordering::Relaxed);
        seq.store(start.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (slot, word) in self.buffer.words.iter().zip(&self.scratch) {
            slot.store(*word, Ordering::Relaxed);
        }
        seq.store(start.wrapping_add(2), Ordering::Release);
    }
}

impl<R> Drop for TelemetryWriter<R> {
    fn drop(&mut self) {
        self.buffer.writer_attached.store(false, Ordering::Release);
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct TelemetryReader<R> {
    buffer: Arc<TelemetryBuffer>,
    scratch: Vec<u64>,
    last_seq: u64,
    _record: PhantomData<fn() -> R>,
}

impl<R: TelemetryRecord> TelemetryReader<R> {
    pub fn attach(buffer: Arc<TelemetryBuffer>) -> Result<Self> {
        buffer.check_layout::<R>()?;
        Ok(Self { buffer, scratch: vec![0; R::WORDS], last_seq: 0, _record: PhantomData })
    }

    /// Latest consistent record with its sequence number. `None` if nothing
    /// was written yet or the writer kept interfering for every retry.
    pub fn read(&mut self) -> Option<(u64, R)> {
        let seq = &self.buffer.seq.0;
        for _ in 0..MAX_READ_RETRIES {
            let before = seq.load(Ordering::Acquire);
            if before == 0 {
                return None;
            }
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            for (word, slot) in self.scratch.iter_mut().zip(self.buffer.words.iter()) {
                *word = slot.load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            if seq.load(Ordering::Relaxed) == before {
                return Some((before, R::decode(&self.scratch)));
            }
            std::hint::spin_loop();
        }
        None
    }

    /// A record only if one was published since the last `poll`.
    pub fn poll(&mut self) -> Option<R> {
        let (seq, record) = self.read()?;
        if seq == self.last_seq {
            return None;
        }
        self.last_seq = seq;
        Some(record)
    }
}

/// Fresh buffer with a writer and a reader attached.
pub fn channel<R: TelemetryRecord>() -> (TelemetryWriter<R>, TelemetryReader<R>) {
    let buffer = TelemetryBuffer::for_record::<R>();
    buffer.writer_attached.store(true, Ordering::Release);
    let writer = TelemetryWriter {
        buffer: Arc::clone(&buffer),
        scratch: vec![0; R::WORDS],
        _record: PhantomData,
    };
    let reader = TelemetryReader { buffer, scratch: vec![0; R::WORDS], last_seq: 0, _record: PhantomData };
    (writer, reader)
}

// ============================================================================
// Transport record
// ============================================================================

/// Transport state published once per processed block.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransportRecord {
    /// Playhead in ticks.
    pub position: f64,
    pub playing: bool,
    /// Blocks processed since the engine started.
    pub block: u64,
}

impl TelemetryRecord for TransportRecord {
    const VERSION: u32 = 1;
    const WORDS: usize = 3;

    fn encode(&self, words: &mut [u64]) {
        words[0] = self.position.to_bits();
        words[1] = u64::from(self.playing);
        words[2] = self.block;
    }

    fn decode(words: &[u64]) -> Self {
        Self {
            position: f64::from_bits(words[0]),
            playing: words[1] != 0,
            block: words[2],
        }
    }
}
