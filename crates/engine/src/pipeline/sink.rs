//! Sink stage: the end of the pipeline.
//!
//! Two sinks share the same render math (fade gain, scope tap, user volume):
//! - a CPAL output stream whose callback drains the final queue without
//!   blocking, owned by a dedicated thread because [`cpal::Stream`] is `!Send`;
//! - a paced null sink that renders and discards audio at wall-clock speed,
//!   used for headless runs and tests.
//!
//! The device sink negotiates its output rate before the rest of the pipeline
//! is wired: the build thread learns the device rate first, decides whether a
//! resample stage is needed, then hands the final queue over.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::device::{pick_buffer_size, pick_device, pick_output_config};
use crate::pipeline::ShutdownLatch;
use crate::queue::{PopStrategy, SampleQueue};
use crate::scope::ScopeAdapter;

/// Frames rendered per null-sink iteration.
const NULL_CHUNK_FRAMES: usize = 512;

/// How long the build waits for the output thread to negotiate or report.
const SINK_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared knobs the render path reads every callback.
///
/// All fields are atomics so the control context can adjust them without ever
/// taking a lock the audio callback holds.
pub(crate) struct RenderControls {
    paused: AtomicBool,
    fade_gain_bits: AtomicU32,
    volume_percent: AtomicU8,
    rendered_frames: AtomicU64,
    underrun_events: AtomicU64,
}

impl RenderControls {
    /// Pipelines start paused; reaching the playing state flips the flag.
    pub fn new(volume_percent: u8) -> Self {
        Self {
            paused: AtomicBool::new(true),
            fade_gain_bits: AtomicU32::new(1.0f32.to_bits()),
            volume_percent: AtomicU8::new(volume_percent.min(100)),
            rendered_frames: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Fade-volume stage gain, separate from the user volume.
    pub fn set_fade_gain(&self, gain: f32) {
        self.fade_gain_bits
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn fade_gain(&self) -> f32 {
        f32::from_bits(self.fade_gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, percent: u8) {
        self.volume_percent.store(percent.min(100), Ordering::Relaxed);
    }

    /// Frames delivered to the output so far; the position clock.
    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames.load(Ordering::Relaxed)
    }

    /// Rebase the position clock after a flush-seek.
    pub fn set_rendered_frames(&self, frames: u64) {
        self.rendered_frames.store(frames, Ordering::Relaxed);
    }

    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }

    /// Apply fade, tap for the scope, then apply user volume, in place.
    ///
    /// The tap sits after the fade and before the user volume, so the scope
    /// shows the fade but a low master volume does not flatten it.
    fn shape(&self, samples: &mut [f32], tap: &mut Vec<f32>) {
        let fade = self.fade_gain();
        let volume = self.volume_percent.load(Ordering::Relaxed) as f32 / 100.0;
        for s in samples.iter_mut() {
            *s *= fade;
            tap.push(*s);
            *s *= volume;
        }
    }
}

/// Stops a running sink. Dropping the handle has the same effect.
pub(crate) struct SinkHandle {
    stop_tx: Sender<()>,
}

impl SinkHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// A device sink that has negotiated its output but is not yet fed.
///
/// Dropping this without calling [`attach`](Self::attach) aborts the output
/// thread cleanly (it sees the feed channel close and exits).
pub(crate) struct PendingDeviceSink {
    rate: u32,
    feed_tx: Sender<Arc<SampleQueue>>,
    result_rx: Receiver<Result<()>>,
    stop_tx: Sender<()>,
}

impl PendingDeviceSink {
    /// The negotiated device sample rate.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Hand over the final queue and wait for the stream to start.
    pub fn attach(self, queue: Arc<SampleQueue>) -> Result<SinkHandle> {
        self.feed_tx
            .send(queue)
            .map_err(|_| anyhow!("output thread exited before attach"))?;
        self.result_rx
            .recv_timeout(SINK_HANDSHAKE_TIMEOUT)
            .map_err(|_| anyhow!("output thread did not report stream start"))??;
        Ok(SinkHandle {
            stop_tx: self.stop_tx,
        })
    }
}

/// Spawn the output thread, pick a device, and negotiate an output config
/// near `source_rate`. Device discovery failures surface here, before any
/// other stage is committed.
pub(crate) fn spawn_device_sink(
    device_name: Option<String>,
    source_rate: u32,
    controls: Arc<RenderControls>,
    scope: Arc<ScopeAdapter>,
    refill_max_frames: usize,
    latch: Arc<ShutdownLatch>,
) -> Result<PendingDeviceSink> {
    let (rate_tx, rate_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
    let (feed_tx, feed_rx) = crossbeam_channel::bounded::<Arc<SampleQueue>>(1);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<Result<()>>(1);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

    latch.register();
    let worker_latch = latch.clone();
    thread::Builder::new()
        .name("pipeline-output".into())
        .spawn(move || {
            run_device_sink(
                device_name.as_deref(),
                source_rate,
                &controls,
                &scope,
                refill_max_frames,
                &rate_tx,
                &feed_rx,
                &result_tx,
                &stop_rx,
            );
            worker_latch.arrive();
        })
        .map_err(|e| {
            latch.arrive();
            anyhow!("spawn output thread: {e}")
        })?;

    let rate = rate_rx
        .recv_timeout(SINK_HANDSHAKE_TIMEOUT)
        .map_err(|_| anyhow!("output thread did not report a device"))??;

    Ok(PendingDeviceSink {
        rate,
        feed_tx,
        result_rx,
        stop_tx,
    })
}

/// Everything CPAL happens on this thread: discovery, stream build, and the
/// final drop of the stream on stop.
fn run_device_sink(
    device_name: Option<&str>,
    source_rate: u32,
    controls: &Arc<RenderControls>,
    scope: &Arc<ScopeAdapter>,
    refill_max_frames: usize,
    rate_tx: &Sender<Result<u32>>,
    feed_rx: &Receiver<Arc<SampleQueue>>,
    result_tx: &Sender<Result<()>>,
    stop_rx: &Receiver<()>,
) {
    let host = cpal::default_host();

    let negotiated = pick_device(&host, device_name).and_then(|device| {
        let supported = pick_output_config(&device, Some(source_rate))?;
        Ok((device, supported))
    });
    let (device, supported) = match negotiated {
        Ok(pair) => pair,
        Err(e) => {
            let _ = rate_tx.send(Err(e));
            return;
        }
    };

    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.config();
    if let Some(size) = pick_buffer_size(&supported) {
        config.buffer_size = size;
    }
    if let Ok(description) = device.description() {
        tracing::info!(device = %description, "output device");
    }
    tracing::debug!(
        rate = config.sample_rate,
        channels = config.channels,
        ?sample_format,
        "output negotiated"
    );
    let _ = rate_tx.send(Ok(config.sample_rate));

    // Build was aborted when the feed channel closes without a queue.
    let queue = match feed_rx.recv() {
        Ok(q) => q,
        Err(_) => return,
    };

    let stream = match build_output_stream(
        &device,
        &config,
        sample_format,
        &queue,
        controls.clone(),
        scope.clone(),
        refill_max_frames,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = result_tx.send(Err(e.into()));
        return;
    }
    let _ = result_tx.send(Ok(()));

    // Parked until teardown (or the handle is dropped).
    let _ = stop_rx.recv();
    drop(stream);
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    controls: Arc<RenderControls>,
    scope: Arc<ScopeAdapter>,
    refill_max_frames: usize,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(device, config, queue, controls, scope, refill_max_frames)
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(device, config, queue, controls, scope, refill_max_frames)
        }
        cpal::SampleFormat::I32 => {
            build_stream::<i32>(device, config, queue, controls, scope, refill_max_frames)
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(device, config, queue, controls, scope, refill_max_frames)
        }
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder. The callback refills a local buffer in
/// bursts, shapes it (fade, tap, volume), and maps channels on the way out.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    controls: Arc<RenderControls>,
    scope: Arc<ScopeAdapter>,
    refill_max_frames: usize,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let refill_max_frames = refill_max_frames.max(1);

    let state = Arc::new(Mutex::new(RenderState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    }));

    let queue_cb = queue.clone();
    let state_cb = state.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            // Pause means pause: silence out, nothing drained.
            if controls.is_paused() {
                data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                return;
            }

            let mut tap: Vec<f32> = Vec::with_capacity(data.len());
            let mut st = state_cb.lock().unwrap();

            let frames = data.len() / channels_out;
            let mut filled_frames = 0usize;

            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    st.src.clear();
                    match queue_cb.pop(PopStrategy::NonBlocking {
                        max_frames: refill_max_frames,
                    }) {
                        Some(mut chunk) => {
                            controls.shape(&mut chunk, &mut tap);
                            st.src = chunk;
                        }
                        None => {
                            controls.underrun_events.fetch_add(1, Ordering::Relaxed);
                            for idx in (frame * channels_out)..data.len() {
                                data[idx] = <T as cpal::Sample>::from_sample::<f32>(0.0);
                            }
                            break;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] =
                        <T as cpal::Sample>::from_sample::<f32>(sample);
                }
                filled_frames += 1;
            }

            if filled_frames > 0 {
                controls
                    .rendered_frames
                    .fetch_add(filled_frames as u64, Ordering::Relaxed);
            }
            drop(st);
            if !tap.is_empty() {
                scope.push(&tap);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Local refill buffer for the output callback.
struct RenderState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read one output sample for `dst_ch` with simple channel mapping:
/// mono→stereo duplicates, stereo→mono averages, anything else clamps to the
/// available channels. `st.pos` advances after the last destination channel.
fn next_sample_mapped(st: &mut RenderState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &RenderState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, 1) => get_src(0, st),
        (2, 2) => get_src(dst_ch.min(1), st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, 2) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

/// Start the null sink: drains the queue at wall-clock speed with the same
/// fade/tap/volume math as the device path, then discards the samples.
pub(crate) fn start_null_sink(
    queue: Arc<SampleQueue>,
    rate: u32,
    controls: Arc<RenderControls>,
    scope: Arc<ScopeAdapter>,
    latch: Arc<ShutdownLatch>,
) -> Result<SinkHandle> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let rate = rate.max(1);
    let channels = queue.channels();

    latch.register();
    let worker_latch = latch.clone();
    thread::Builder::new()
        .name("pipeline-null-output".into())
        .spawn(move || {
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                if controls.is_paused() {
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                match queue.pop(PopStrategy::NonBlocking {
                    max_frames: NULL_CHUNK_FRAMES,
                }) {
                    Some(mut chunk) => {
                        let mut tap: Vec<f32> = Vec::with_capacity(chunk.len());
                        controls.shape(&mut chunk, &mut tap);
                        scope.push(&tap);
                        let frames = chunk.len() / channels;
                        controls
                            .rendered_frames
                            .fetch_add(frames as u64, Ordering::Relaxed);
                        thread::sleep(Duration::from_millis(
                            frames as u64 * 1000 / rate as u64,
                        ));
                    }
                    None => {
                        if queue.is_closed() {
                            break;
                        }
                        thread::sleep(Duration::from_millis(5));
                    }
                }
            }
            worker_latch.arrive();
        })
        .map_err(|e| {
            latch.arrive();
            anyhow!("spawn null output thread: {e}")
        })?;

    Ok(SinkHandle { stop_tx })
}
