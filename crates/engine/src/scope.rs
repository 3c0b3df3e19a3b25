//! Visualization scope: a snapshot of the most recently rendered audio.
//!
//! The sink stage taps post-fade samples into [`ScopeAdapter`] (one writer,
//! the render thread) and the UI reads 512-sample mono snapshots out of it
//! (one reader). A single mutex guards the adapter, mirroring the stream
//! buffer's locking discipline.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Samples per scope snapshot (mono, downmixed).
pub const SCOPE_SIZE: usize = 512;

/// Safety cap on accumulated tap data, in samples. Anything older is dropped
/// so a UI that stops polling cannot grow the adapter without bound.
const ADAPTER_MAX_SAMPLES: usize = 65_536;

/// Accumulates interleaved samples handed off by the sink's tap.
pub struct ScopeAdapter {
    channels: usize,
    samples: Mutex<VecDeque<f32>>,
}

impl ScopeAdapter {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Tap callback: append one rendered buffer. Non-blocking for practical
    /// purposes; the reader only holds the lock for short copies.
    pub fn push(&self, interleaved: &[f32]) {
        let mut g = self.samples.lock().unwrap();
        g.extend(interleaved.iter().copied());
        let len = g.len();
        if len > ADAPTER_MAX_SAMPLES {
            g.drain(..len - ADAPTER_MAX_SAMPLES);
        }
    }

    /// Copy the oldest buffered snapshot into `out`, downmixed to mono by
    /// averaging channels, and advance past the consumed samples.
    ///
    /// Returns `false` without touching `out` when fewer than
    /// `SCOPE_SIZE * channels` samples are buffered; the caller keeps its
    /// previous scope in that case.
    pub fn read_scope(&self, out: &mut [f32; SCOPE_SIZE]) -> bool {
        let need = SCOPE_SIZE * self.channels;
        let mut g = self.samples.lock().unwrap();
        if g.len() < need {
            return false;
        }

        for (i, slot) in out.iter_mut().enumerate() {
            let frame = i * self.channels;
            let mut acc = 0.0f32;
            for ch in 0..self.channels {
                acc += g[frame + ch];
            }
            *slot = acc / self.channels as f32;
        }
        g.drain(..need);
        true
    }

    /// Drop everything buffered. Called on teardown.
    pub fn clear(&self) {
        self.samples.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }
}
