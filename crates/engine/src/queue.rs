//! Bounded queues of interleaved `f32` samples linking pipeline stages.
//!
//! Every stage boundary in the pipeline (decoder → resampler → sink) is one
//! of these queues:
//! - producers block when the queue is full,
//! - the sink drains without blocking,
//! - `close()` makes shutdown deterministic (drain, then `None`),
//! - `flush()` discards buffered audio for seek without ending the stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// Samples are stored interleaved (`frame0[ch0], frame0[ch1], ...`); the
/// channel count is fixed for the lifetime of the queue. A single [`Condvar`]
/// signals every state change, and the closed flag lives under the same mutex
/// as the sample storage so producers and consumers cannot race on it.
pub struct SampleQueue {
    channels: usize,
    max_samples: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    starved_log_ms: AtomicU64,
}

struct QueueInner {
    samples: VecDeque<f32>,
    closed: bool,
}

/// How to pop interleaved frames from the queue.
pub enum PopStrategy {
    /// Block until exactly `frames` are buffered; `None` if the queue closes
    /// before enough data arrives.
    BlockingExact { frames: usize },
    /// Block until at least one frame is buffered, then return up to
    /// `max_frames`; `None` once closed and drained.
    BlockingUpTo { max_frames: usize },
    /// Return immediately with up to `max_frames`, or `None` when empty.
    NonBlocking { max_frames: usize },
}

/// Queue capacity in samples for `(rate, channels, seconds)` of audio.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn max_samples_for(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SampleQueue {
    pub fn new(channels: usize, max_samples: usize) -> Self {
        Self {
            channels,
            max_samples,
            inner: Mutex::new(QueueInner {
                samples: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
            starved_log_ms: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.max_samples / self.channels
    }

    /// Buffered frames right now (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        let g = self.inner.lock().unwrap();
        g.samples.len() / self.channels
    }

    /// Whether the producer has closed the queue. A closed queue may still
    /// hold samples until drained.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Mark the stream as finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Discard all buffered samples without closing the queue.
    ///
    /// Used by flush-seek: stale audio decoded before the seek point must not
    /// reach the sink.
    pub fn flush(&self) {
        let mut g = self.inner.lock().unwrap();
        g.samples.clear();
        drop(g);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns early (dropping the remainder) if the queue is closed while
    /// waiting; that only happens during teardown.
    pub fn push_blocking(&self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.samples.len() >= self.max_samples && !g.closed {
                g = self.cv.wait(g).unwrap();
            }
            if g.closed {
                return;
            }

            while offset < samples.len() && g.samples.len() < self.max_samples {
                g.samples.push_back(samples[offset]);
                offset += 1;
            }
            drop(g);
            self.cv.notify_all();
        }
    }

    /// Pop interleaved frames using `strategy`.
    ///
    /// Returns `None` when the queue is closed and cannot satisfy the request.
    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();

        let take_samples = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while g.samples.len() < want && !g.closed {
                    g = self.cv.wait(g).unwrap();
                }
                if g.samples.len() < want {
                    return None;
                }
                want
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.samples.is_empty() && !g.closed {
                    g = self.cv.wait(g).unwrap();
                }
                if g.samples.is_empty() {
                    return None;
                }
                let frames = (g.samples.len() / self.channels).min(max_frames);
                frames * self.channels
            }
            PopStrategy::NonBlocking { max_frames } => {
                let frames = (g.samples.len() / self.channels).min(max_frames);
                if frames == 0 {
                    return None;
                }
                frames * self.channels
            }
        };

        let mut out = Vec::with_capacity(take_samples);
        for _ in 0..take_samples {
            out.push(g.samples.pop_front().unwrap_or(0.0));
        }
        let remaining = g.samples.len();
        drop(g);
        self.cv.notify_all();
        self.log_if_starved(remaining);
        Some(out)
    }

    /// Rate-limited log when the queue is about to underrun.
    fn log_if_starved(&self, queued: usize) {
        let threshold = (self.max_samples / 8).max(self.channels * 16);
        if queued == 0 || queued >= threshold {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let last = self.starved_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.starved_log_ms.store(now, Ordering::Relaxed);
            tracing::debug!(
                queued_samples = queued,
                threshold_samples = threshold,
                "sample queue running low"
            );
        }
    }
}

/// Block until `q` is closed and fully drained, or `cancel` becomes true.
///
/// Returns `true` when the queue drained normally (end of stream), `false`
/// when cancelled. The end-of-stream watcher uses this to distinguish a
/// natural finish from teardown.
pub fn wait_drained_or_cancelled(q: &Arc<SampleQueue>, cancel: &Arc<AtomicBool>) -> bool {
    let mut g = q.inner.lock().unwrap();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        if g.closed && g.samples.is_empty() {
            return true;
        }
        let (ng, _timeout) = q.cv.wait_timeout(g, Duration::from_millis(50)).unwrap();
        g = ng;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn max_samples_for_fallbacks() {
        assert_eq!(max_samples_for(48_000, 2, 2.0), 192_000);
        assert_eq!(max_samples_for(48_000, 2, -1.0), 192_000);
        assert_eq!(max_samples_for(48_000, 2, f32::NAN), 192_000);
    }

    #[test]
    fn pop_nonblocking_on_empty_queue() {
        let q = SampleQueue::new(2, 16);
        assert!(q.pop(PopStrategy::NonBlocking { max_frames: 4 }).is_none());
    }

    #[test]
    fn pop_blocking_exact_waits_for_full_frames() {
        let q = Arc::new(SampleQueue::new(2, 64));
        let producer = q.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();

        let handle = thread::spawn(move || {
            start.wait();
            let out = q.pop(PopStrategy::BlockingExact { frames: 3 }).unwrap();
            assert_eq!(out.len(), 6);
        });

        barrier.wait();
        producer.push_blocking(&[0.1, 0.2, 0.3, 0.4]);
        producer.push_blocking(&[0.5, 0.6]);
        handle.join().unwrap();
    }

    #[test]
    fn pop_blocking_up_to_drains_tail_then_ends() {
        let q = Arc::new(SampleQueue::new(2, 64));
        let consumer = q.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();

        let handle = thread::spawn(move || {
            start.wait();
            let out = consumer
                .pop(PopStrategy::BlockingUpTo { max_frames: 8 })
                .unwrap();
            assert_eq!(out.len(), 4);
            assert!(consumer
                .pop(PopStrategy::BlockingUpTo { max_frames: 8 })
                .is_none());
        });

        barrier.wait();
        q.push_blocking(&[1.0, 2.0, 3.0, 4.0]);
        q.close();
        handle.join().unwrap();
    }

    #[test]
    fn flush_discards_samples_but_keeps_stream_open() {
        let q = SampleQueue::new(2, 64);
        q.push_blocking(&[1.0, 2.0, 3.0, 4.0]);
        q.flush();
        assert_eq!(q.len_frames(), 0);
        assert!(!q.is_closed());
        q.push_blocking(&[5.0, 6.0]);
        let out = q.pop(PopStrategy::NonBlocking { max_frames: 4 }).unwrap();
        assert_eq!(out, vec![5.0, 6.0]);
    }

    #[test]
    fn close_unblocks_exact_pop() {
        let q = SampleQueue::new(2, 64);
        q.close();
        assert!(q.pop(PopStrategy::BlockingExact { frames: 1 }).is_none());
    }

    #[test]
    fn wait_drained_reports_natural_end() {
        let q = Arc::new(SampleQueue::new(2, 64));
        let cancel = Arc::new(AtomicBool::new(false));
        q.close();
        assert!(wait_drained_or_cancelled(&q, &cancel));
    }

    #[test]
    fn wait_drained_respects_cancel() {
        let q = Arc::new(SampleQueue::new(2, 64));
        let cancel = Arc::new(AtomicBool::new(true));
        assert!(!wait_drained_or_cancelled(&q, &cancel));
    }
}
