//! Stream ingestion buffer shared by the transfer job and the pipeline source.
//!
//! [`StreamBuffer`] is a fixed-capacity byte buffer with one writer (the
//! network delivery thread) and one reader (the pipeline's source). A single
//! mutex guards the cursor and the stop flag; the single-writer/single-reader
//! discipline is a required invariant, not an implementation detail.
//!
//! Overflow policy is deliberately lossy: when a push would cross capacity the
//! cursor wraps to zero and the chunk is dropped. Streamed audio tolerates a
//! brief glitch better than a stall, so the producer never blocks.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::Sender;
use symphonia::core::io::MediaSource;

use crate::messages::EngineMessage;

/// Default stream buffer capacity (1 MB).
pub const STREAM_BUF_SIZE: usize = 1_000_000;

/// Fixed-capacity byte buffer between the transfer thread and the source.
pub struct StreamBuffer {
    capacity: usize,
    inner: Mutex<BufferInner>,
    cv: Condvar,
}

struct BufferInner {
    data: Vec<u8>,
    /// Write cursor; invariant `0 <= index <= capacity`.
    index: usize,
    /// Set once the transfer delivered everything: drain, then end of stream.
    stop: bool,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::with_capacity(STREAM_BUF_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(BufferInner {
                data: vec![0; capacity],
                index: 0,
                stop: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Fill level above which the transfer job is suspended (~95% of capacity).
    pub fn high_water(&self) -> usize {
        self.capacity / 100 * 95
    }

    /// Fill level below which a suspended transfer is resumed (~5% of
    /// capacity). Also the prebuffer threshold the source waits for.
    pub fn low_water(&self) -> usize {
        self.capacity / 100 * 5
    }

    /// Current fill level in bytes.
    pub fn fill(&self) -> usize {
        self.inner.lock().unwrap().index
    }

    /// Append a chunk at the write cursor; returns the fill level afterwards.
    ///
    /// A chunk that would cross capacity resets the cursor to zero and is
    /// dropped (lossy wrap, logged). Never blocks.
    pub fn push(&self, chunk: &[u8]) -> usize {
        let mut g = self.inner.lock().unwrap();
        if g.index + chunk.len() >= self.capacity {
            tracing::warn!(
                dropped_bytes = chunk.len(),
                buffered_bytes = g.index,
                "stream buffer overflow, wrapping"
            );
            g.index = 0;
        } else {
            let index = g.index;
            g.data[index..index + chunk.len()].copy_from_slice(chunk);
            g.index += chunk.len();
        }
        let fill = g.index;
        drop(g);
        self.cv.notify_all();
        fill
    }

    /// Mark the end of the stream. The reader drains what is buffered and
    /// then sees end of stream; this is not an immediate cutoff. Idempotent.
    pub fn signal_end(&self) {
        let mut g = self.inner.lock().unwrap();
        g.stop = true;
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stop
    }

    /// Rewind the buffer for a fresh load (`index = 0`, `stop = false`).
    pub fn reset(&self) {
        let mut g = self.inner.lock().unwrap();
        g.index = 0;
        g.stop = false;
        drop(g);
        self.cv.notify_all();
    }

    /// Drain up to `out.len()` bytes from the front of the buffer.
    ///
    /// Blocks until at least `min_fill` bytes are buffered or the stream has
    /// been ended; once ended, whatever remains is handed out. Returns the
    /// bytes copied and the fill level after the drain; `(0, 0)` means end of
    /// stream.
    pub fn drain_into(&self, out: &mut [u8], min_fill: usize) -> (usize, usize) {
        let mut g = self.inner.lock().unwrap();
        while g.index < min_fill.max(1) && !g.stop {
            g = self.cv.wait(g).unwrap();
        }
        if g.index == 0 {
            // stop was signaled and everything has drained
            return (0, 0);
        }

        let n = out.len().min(g.index);
        out[..n].copy_from_slice(&g.data[..n]);
        let index = g.index;
        g.data.copy_within(n..index, 0);
        g.index -= n;
        let fill = g.index;
        drop(g);
        self.cv.notify_all();
        (n, fill)
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline source stage draining a [`StreamBuffer`].
///
/// Runs on the pipeline's internal streaming thread (the decoder). Reads
/// block until the prebuffer threshold is met, and each drain that leaves the
/// buffer below the low-water mark posts a room signal so the engine can
/// resume a suspended transfer job.
pub struct StreamSource {
    buffer: Arc<StreamBuffer>,
    min_fill: usize,
    generation: u64,
    messages: Sender<EngineMessage>,
    room_flagged: bool,
    started: bool,
}

impl StreamSource {
    pub fn new(
        buffer: Arc<StreamBuffer>,
        generation: u64,
        messages: Sender<EngineMessage>,
    ) -> Self {
        let min_fill = buffer.low_water();
        Self {
            buffer,
            min_fill,
            generation,
            messages,
            room_flagged: false,
            started: false,
        }
    }
}

impl Read for StreamSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        // Prebuffer only before the first byte; afterwards any data will do.
        let min_fill = if self.started { 1 } else { self.min_fill };
        let (n, fill) = self.buffer.drain_into(out, min_fill);
        if n == 0 {
            return Ok(0);
        }
        self.started = true;

        if fill < self.buffer.low_water() {
            if !self.room_flagged {
                self.room_flagged = true;
                let _ = self.messages.send(EngineMessage::SourceHasRoom {
                    generation: self.generation,
                });
            }
        } else {
            self.room_flagged = false;
        }
        Ok(n)
    }
}

impl Seek for StreamSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream source is not seekable",
        ))
    }
}

impl MediaSource for StreamSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
