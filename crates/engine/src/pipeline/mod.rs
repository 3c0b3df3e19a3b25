//! Pipeline graph: source → decode → (resample) → sink.
//!
//! Built as a unit during load and destroyed as a unit. Stages run on their
//! own threads connected by bounded sample queues; the graph owns the handles
//! and a shutdown latch that every stage thread arrives at on exit, so
//! teardown can wait for the whole pipeline with a bound instead of spinning.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::Sender;
use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;
use tonearm_engine_types::TrackRef;

use crate::buffer::{StreamBuffer, StreamSource};
use crate::config::{EngineConfig, Output};
use crate::messages::EngineMessage;
use crate::pipeline::decoder::{DecodedStream, DecoderCommand, start_decoder};
use crate::pipeline::resample::start_resampler;
use crate::pipeline::sink::{RenderControls, SinkHandle, spawn_device_sink, start_null_sink};
use crate::queue::{SampleQueue, wait_drained_or_cancelled};
use crate::scope::{SCOPE_SIZE, ScopeAdapter};

pub(crate) mod decoder;
mod resample;
mod sink;

/// Bound on waiting for stage threads during teardown. A stage that has not
/// arrived by then is abandoned (logged), never busy-waited on.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Realization state of the pipeline, separate from the engine's user-facing
/// state. `Null` only exists transiently during build and teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Counts stage threads still running; teardown waits on it with a timeout.
pub(crate) struct ShutdownLatch {
    pending: std::sync::Mutex<usize>,
    cv: std::sync::Condvar,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self {
            pending: std::sync::Mutex::new(0),
            cv: std::sync::Condvar::new(),
        }
    }

    /// Called before a stage thread spawns.
    pub fn register(&self) {
        *self.pending.lock().unwrap() += 1;
    }

    /// Called by a stage thread as its last act.
    pub fn arrive(&self) {
        let mut g = self.pending.lock().unwrap();
        *g = g.saturating_sub(1);
        drop(g);
        self.cv.notify_all();
    }

    /// Wait until every registered thread has arrived, or `timeout` elapses.
    /// Returns `true` when the latch went idle in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.pending.lock().unwrap();
        while *g > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }
        true
    }
}

/// A realized pipeline for one track.
pub(crate) struct PipelineGraph {
    generation: u64,
    state: PipelineState,
    controls: Arc<RenderControls>,
    scope: Arc<ScopeAdapter>,
    commands: Sender<DecoderCommand>,
    decoder_queue: Arc<SampleQueue>,
    sink_queue: Arc<SampleQueue>,
    sink: SinkHandle,
    latch: Arc<ShutdownLatch>,
    cancel: Arc<AtomicBool>,
    stream_buffer: Option<Arc<StreamBuffer>>,
    output_rate: u32,
    duration_ms: Option<u64>,
    seekable: bool,
    torn_down: bool,
}

impl PipelineGraph {
    /// Build the whole graph for `track`. All-or-nothing: any stage failing
    /// to create unwinds the stages built so far and returns the error.
    ///
    /// For remote tracks the transfer job must already be feeding
    /// `stream_buffer`; probing blocks until the prebuffer threshold is met.
    pub fn build(
        track: &TrackRef,
        config: &EngineConfig,
        output: &Output,
        generation: u64,
        volume_percent: u8,
        stream_buffer: Option<Arc<StreamBuffer>>,
        messages: Sender<EngineMessage>,
    ) -> Result<Self> {
        let latch = Arc::new(ShutdownLatch::new());
        let cancel = Arc::new(AtomicBool::new(false));

        let (source, hint): (Box<dyn MediaSource>, Hint) = if track.is_local {
            let file = std::fs::File::open(&track.url)
                .with_context(|| format!("open {}", track.url))?;
            let mut hint = Hint::new();
            if let Some(ext) = Path::new(&track.url).extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }
            (Box::new(file), hint)
        } else {
            let buffer = stream_buffer
                .clone()
                .ok_or_else(|| anyhow!("remote track without a stream buffer"))?;
            let source = StreamSource::new(buffer, generation, messages.clone());
            (Box::new(source), Hint::new())
        };

        let DecodedStream {
            spec,
            queue: decoder_queue,
            duration_ms,
            commands,
            seekable,
        } = start_decoder(
            source,
            hint,
            config.buffer_seconds,
            generation,
            messages.clone(),
            latch.clone(),
        )?;

        let channels = spec.channels.count();
        let controls = Arc::new(RenderControls::new(volume_percent));
        let scope = Arc::new(ScopeAdapter::new(channels));

        let build_sink = || -> Result<(SinkHandle, Arc<SampleQueue>, u32)> {
            match output {
                Output::Null => {
                    let sink = start_null_sink(
                        decoder_queue.clone(),
                        spec.rate,
                        controls.clone(),
                        scope.clone(),
                        latch.clone(),
                    )?;
                    Ok((sink, decoder_queue.clone(), spec.rate))
                }
                Output::Device { name } => {
                    let pending = spawn_device_sink(
                        name.clone(),
                        spec.rate,
                        controls.clone(),
                        scope.clone(),
                        config.refill_max_frames,
                        latch.clone(),
                    )?;
                    let rate = pending.rate();
                    let final_queue = if rate == spec.rate {
                        decoder_queue.clone()
                    } else {
                        start_resampler(
                            decoder_queue.clone(),
                            spec.rate,
                            rate,
                            config.chunk_frames,
                            config.buffer_seconds,
                            latch.clone(),
                        )?
                    };
                    let sink = pending.attach(final_queue.clone())?;
                    Ok((sink, final_queue, rate))
                }
            }
        };

        let (sink, sink_queue, output_rate) = match build_sink() {
            Ok(parts) => parts,
            Err(e) => {
                abort_build(&decoder_queue, stream_buffer.as_deref(), &cancel, &latch);
                return Err(e);
            }
        };

        spawn_eos_watcher(
            sink_queue.clone(),
            cancel.clone(),
            generation,
            messages,
            latch.clone(),
        )?;

        tracing::debug!(
            generation,
            rate = spec.rate,
            channels,
            output_rate,
            seekable,
            priority = config.thread_priority,
            "pipeline built"
        );

        Ok(Self {
            generation,
            state: PipelineState::Null,
            controls,
            scope,
            commands,
            decoder_queue,
            sink_queue,
            sink,
            latch,
            cancel,
            stream_buffer,
            output_rate,
            duration_ms,
            seekable,
            torn_down: false,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Move the pipeline between realized states. `Ready` and `Paused` both
    /// hold the render clock; `Playing` releases it.
    pub fn set_state(&mut self, target: PipelineState) -> Result<()> {
        match target {
            PipelineState::Null => bail!("the null state is reached through teardown"),
            PipelineState::Ready | PipelineState::Paused => self.controls.set_paused(true),
            PipelineState::Playing => self.controls.set_paused(false),
        }
        self.state = target;
        Ok(())
    }

    /// Playback position in milliseconds, derived from the render clock.
    pub fn position_ms(&self) -> u64 {
        self.controls.rendered_frames() * 1000 / self.output_rate.max(1) as u64
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Whether the stream has played out: the final queue is closed and
    /// empty, so no render can ever happen again on this graph.
    pub fn is_drained(&self) -> bool {
        self.sink_queue.is_closed() && self.sink_queue.len_frames() == 0
    }

    /// Gain for the fade-volume stage; the user volume is untouched.
    pub fn set_fade_gain(&self, gain: f32) {
        self.controls.set_fade_gain(gain);
    }

    pub fn set_volume(&self, percent: u8) {
        self.controls.set_volume(percent);
    }

    /// Copy the latest rendered snapshot into `out`. `false` keeps `out`
    /// untouched (not enough fresh audio since the last read).
    pub fn read_scope(&self, out: &mut [f32; SCOPE_SIZE]) -> bool {
        self.scope.read_scope(out)
    }

    /// Flush-seek to `ms`. Ignored for unseekable sources and for `ms == 0`
    /// (every load already starts at the beginning).
    pub fn seek(&mut self, ms: u64) {
        if ms == 0 {
            return;
        }
        if !self.seekable {
            tracing::debug!(ms, "seek ignored, source is not seekable");
            return;
        }
        let ms = match self.duration_ms {
            Some(d) => ms.min(d),
            None => ms,
        };
        // The decoder flushes its own queue and the downstream queue after
        // the reader confirmed the seek; flushing here instead would let a
        // stage in between refill the sink with pre-seek audio.
        let command = DecoderCommand::Seek {
            ms,
            downstream: self.sink_queue.clone(),
        };
        if self.commands.send(command).is_err() {
            // Decoder already exited; the stream is at its end.
            return;
        }
        self.controls
            .set_rendered_frames(ms * self.output_rate as u64 / 1000);
    }

    /// Destroy the pipeline: cancel stages, unblock every queue, and wait for
    /// the stage threads with a bound. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.state = PipelineState::Null;

        self.cancel.store(true, Ordering::Relaxed);
        self.decoder_queue.close();
        self.sink_queue.close();
        if let Some(buffer) = &self.stream_buffer {
            buffer.signal_end();
        }
        self.sink.stop();
        self.scope.clear();

        if !self.latch.wait_idle(SHUTDOWN_TIMEOUT) {
            tracing::warn!(
                generation = self.generation,
                "pipeline threads did not exit in time, abandoning"
            );
        }
        let underruns = self.controls.underrun_events();
        if underruns > 0 {
            tracing::debug!(generation = self.generation, underruns, "pipeline stats");
        }
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Unwind a partially built graph: only the decoder (and for remote tracks
/// the stream source) exist at this point.
fn abort_build(
    decoder_queue: &Arc<SampleQueue>,
    stream_buffer: Option<&StreamBuffer>,
    cancel: &Arc<AtomicBool>,
    latch: &Arc<ShutdownLatch>,
) {
    cancel.store(true, Ordering::Relaxed);
    decoder_queue.close();
    if let Some(buffer) = stream_buffer {
        buffer.signal_end();
    }
    if !latch.wait_idle(SHUTDOWN_TIMEOUT) {
        tracing::warn!("stage threads did not exit after failed build");
    }
}

/// Watches the final queue and reports a natural end of stream. Teardown
/// cancels the watcher before the queue drains, so no spurious report.
fn spawn_eos_watcher(
    sink_queue: Arc<SampleQueue>,
    cancel: Arc<AtomicBool>,
    generation: u64,
    messages: Sender<EngineMessage>,
    latch: Arc<ShutdownLatch>,
) -> Result<()> {
    latch.register();
    let worker_latch = latch.clone();
    thread::Builder::new()
        .name("pipeline-eos".into())
        .spawn(move || {
            if wait_drained_or_cancelled(&sink_queue, &cancel) {
                let _ = messages.send(EngineMessage::EndOfStream { generation });
            }
            worker_latch.arrive();
        })
        .map_err(|e| {
            latch.arrive();
            anyhow!("spawn end-of-stream watcher: {e}")
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_test_wav;

    fn test_config() -> EngineConfig {
        EngineConfig {
            buffer_seconds: 1.0,
            ..EngineConfig::default()
        }
    }

    fn build_local(
        path: &std::path::Path,
        generation: u64,
    ) -> (PipelineGraph, crossbeam_channel::Receiver<EngineMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let graph = PipelineGraph::build(
            &TrackRef::local(path.to_string_lossy()),
            &test_config(),
            &Output::Null,
            generation,
            100,
            None,
            tx,
        )
        .expect("pipeline builds");
        (graph, rx)
    }

    #[test]
    fn plays_local_file_to_end_of_stream() {
        let dir = std::env::temp_dir().join("tonearm-pipeline-eos");
        std::fs::create_dir_all(&dir).unwrap();
        let wav = dir.join("short.wav");
        write_test_wav(&wav, 1600, 8_000, 1).unwrap();

        let (mut graph, rx) = build_local(&wav, 7);
        graph.set_state(PipelineState::Playing).unwrap();

        let msg = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("end of stream reported");
        assert_eq!(msg, EngineMessage::EndOfStream { generation: 7 });
        assert!(graph.position_ms() > 0);

        graph.teardown();
        graph.teardown(); // idempotent
    }

    #[test]
    fn ready_pipeline_renders_nothing() {
        let dir = std::env::temp_dir().join("tonearm-pipeline-ready");
        std::fs::create_dir_all(&dir).unwrap();
        let wav = dir.join("idle.wav");
        write_test_wav(&wav, 8_000, 8_000, 1).unwrap();

        let (mut graph, _rx) = build_local(&wav, 1);
        graph.set_state(PipelineState::Ready).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(graph.position_ms(), 0);
        graph.teardown();
    }

    #[test]
    fn teardown_mid_play_reports_no_end_of_stream() {
        let dir = std::env::temp_dir().join("tonearm-pipeline-cancel");
        std::fs::create_dir_all(&dir).unwrap();
        let wav = dir.join("long.wav");
        write_test_wav(&wav, 80_000, 8_000, 1).unwrap(); // 10 seconds

        let (mut graph, rx) = build_local(&wav, 3);
        graph.set_state(PipelineState::Playing).unwrap();
        thread::sleep(Duration::from_millis(100));
        graph.teardown();

        assert!(
            rx.try_iter()
                .all(|m| !matches!(m, EngineMessage::EndOfStream { .. })),
            "cancelled pipeline must not report end of stream"
        );
    }

    #[test]
    fn missing_file_fails_the_build() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let result = PipelineGraph::build(
            &TrackRef::local("/nonexistent/track.flac"),
            &test_config(),
            &Output::Null,
            0,
            100,
            None,
            tx,
        );
        assert!(result.is_err());
    }

    #[test]
    fn seek_on_unseekable_source_is_ignored() {
        let dir = std::env::temp_dir().join("tonearm-pipeline-seek");
        std::fs::create_dir_all(&dir).unwrap();
        let wav = dir.join("seek.wav");
        write_test_wav(&wav, 16_000, 8_000, 1).unwrap();

        let (mut graph, _rx) = build_local(&wav, 2);
        graph.seekable = false;
        graph.seek(500);
        assert_eq!(graph.position_ms(), 0);
        graph.teardown();
    }

    #[test]
    fn seek_rebases_the_position_clock() {
        let dir = std::env::temp_dir().join("tonearm-pipeline-seek2");
        std::fs::create_dir_all(&dir).unwrap();
        let wav = dir.join("seek2.wav");
        write_test_wav(&wav, 16_000, 8_000, 1).unwrap(); // 2 seconds

        let (mut graph, _rx) = build_local(&wav, 2);
        graph.seek(1_000);
        assert_eq!(graph.position_ms(), 1_000);
        // Past-the-end target clamps to the duration.
        graph.seek(60_000);
        assert_eq!(graph.position_ms(), 2_000);
        graph.teardown();
    }

    #[test]
    fn latch_wait_times_out_when_threads_remain() {
        let latch = ShutdownLatch::new();
        latch.register();
        assert!(!latch.wait_idle(Duration::from_millis(50)));
        latch.arrive();
        assert!(latch.wait_idle(Duration::from_millis(50)));
    }
}
