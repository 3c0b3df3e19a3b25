//! Resample stage, inserted only when the source and output rates differ.
//!
//! Rubato's streaming sinc resampler converts decoded interleaved `f32` from
//! the source rate to the device rate on its own thread, feeding a second
//! bounded queue. The resampler is constructed before the thread spawns so a
//! bad rate ratio fails the pipeline build.

use std::sync::Arc;
use std::thread;

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::pipeline::ShutdownLatch;
use crate::queue::{PopStrategy, SampleQueue, max_samples_for};

/// Start the resample thread. Reads `chunk_frames`-sized chunks from `srcq`
/// at `src_rate` and produces samples at `dst_rate` into the returned queue.
///
/// When `srcq` closes, the tail (a final partial chunk) is processed with
/// `partial_len` and the output queue is closed behind it.
pub(crate) fn start_resampler(
    srcq: Arc<SampleQueue>,
    src_rate: u32,
    dst_rate: u32,
    chunk_frames: usize,
    buffer_seconds: f32,
    latch: Arc<ShutdownLatch>,
) -> Result<Arc<SampleQueue>> {
    let channels = srcq.channels();
    let chunk_frames = chunk_frames.max(1);
    let f_ratio = dst_rate as f64 / src_rate as f64;

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    let mut resampler: Box<dyn Resampler<f32>> = Box::new(
        Async::<f32>::new_sinc(f_ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)
            .map_err(|e| anyhow!("resampler init ({src_rate} -> {dst_rate} Hz): {e}"))?,
    );

    let dstq = Arc::new(SampleQueue::new(
        channels,
        max_samples_for(dst_rate, channels, buffer_seconds),
    ));

    let dstq_thread = dstq.clone();
    latch.register();
    let worker_latch = latch.clone();
    thread::Builder::new()
        .name("pipeline-resample".into())
        .spawn(move || {
            let mut out = vec![0.0f32; channels * chunk_frames * 3];

            loop {
                let chunk = match srcq.pop(PopStrategy::BlockingExact {
                    frames: chunk_frames,
                }) {
                    Some(v) => v,
                    None => break,
                };
                if !process_chunk(
                    resampler.as_mut(),
                    &chunk,
                    chunk_frames,
                    None,
                    channels,
                    &mut out,
                    &dstq_thread,
                ) {
                    break;
                }
            }

            // Tail: whatever remains after close is shorter than a chunk.
            while let Some(tail) = srcq.pop(PopStrategy::BlockingUpTo {
                max_frames: chunk_frames,
            }) {
                let tail_frames = tail.len() / channels;
                if tail_frames == 0 {
                    continue;
                }
                if !process_chunk(
                    resampler.as_mut(),
                    &tail,
                    tail_frames,
                    Some(tail_frames),
                    channels,
                    &mut out,
                    &dstq_thread,
                ) {
                    break;
                }
            }

            dstq_thread.close();
            worker_latch.arrive();
        })
        .map_err(|e| {
            latch.arrive();
            anyhow!("spawn resample thread: {e}")
        })?;

    Ok(dstq)
}

/// Run one chunk through the resampler and push the produced samples.
/// Returns `false` on an unrecoverable adapter/process error.
fn process_chunk(
    resampler: &mut dyn Resampler<f32>,
    input: &[f32],
    input_frames: usize,
    partial_len: Option<usize>,
    channels: usize,
    out: &mut [f32],
    dstq: &Arc<SampleQueue>,
) -> bool {
    let input_adapter = match InterleavedSlice::new(input, channels, input_frames) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("resample input adapter: {e:#}");
            return false;
        }
    };

    let out_capacity_frames = out.len() / channels;
    let mut output_adapter = match InterleavedSlice::new_mut(out, channels, out_capacity_frames) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("resample output adapter: {e:#}");
            return false;
        }
    };

    let indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len,
    };

    let (_consumed, produced_frames) =
        match resampler.process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing)) {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("resample process: {e:#}");
                return false;
            }
        };

    let produced = produced_frames * channels;
    if produced > 0 {
        dstq.push_blocking(&out[..produced]);
    }
    true
}
