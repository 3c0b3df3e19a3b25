//! Decode stage: Symphonia probe + packet loop on a worker thread.
//!
//! The probe and codec construction happen synchronously so a broken source
//! fails the build, not playback. The worker decodes packets into interleaved
//! `f32`, pushes them into a bounded queue, and services flush-seek commands
//! between packets.

use std::sync::Arc;
use std::thread;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::messages::EngineMessage;
use crate::pipeline::ShutdownLatch;
use crate::queue::{SampleQueue, max_samples_for};

/// Commands serviced by the decode worker between packets.
pub(crate) enum DecoderCommand {
    /// Flush-seek to an absolute position in milliseconds. `downstream` is
    /// the final queue feeding the sink; it is flushed only after the reader
    /// confirmed the seek, so stages between the decoder and the sink cannot
    /// refill it with pre-seek audio afterwards.
    Seek {
        ms: u64,
        downstream: Arc<SampleQueue>,
    },
}

/// Handles to a running decode stage.
pub(crate) struct DecodedStream {
    pub spec: SignalSpec,
    pub queue: Arc<SampleQueue>,
    pub duration_ms: Option<u64>,
    pub commands: Sender<DecoderCommand>,
    pub seekable: bool,
}

/// Probe `source` and start the decode worker.
///
/// Fails fast (no thread spawned, no queue created) when the container cannot
/// be probed or no decoder exists for the track.
pub(crate) fn start_decoder(
    source: Box<dyn MediaSource>,
    hint: Hint,
    buffer_seconds: f32,
    generation: u64,
    messages: Sender<EngineMessage>,
    latch: Arc<ShutdownLatch>,
) -> Result<DecodedStream> {
    let seekable = source.is_seekable();
    let mss = MediaSourceStream::new(source, Default::default());

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channel layout"))?;
    let rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;

    let spec = SignalSpec::new(rate, channels);
    let codec_params: CodecParameters = track.codec_params.clone();
    let duration_ms = duration_ms_from_params(&codec_params);

    // Codec construction is part of the build: a missing decoder is a
    // stage-creation failure, fatal to this load only.
    let decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    let max_samples = max_samples_for(rate, channels.count(), buffer_seconds);
    let queue = Arc::new(SampleQueue::new(channels.count(), max_samples));

    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    let worker_queue = queue.clone();
    latch.register();
    let worker_latch = latch.clone();
    thread::Builder::new()
        .name("pipeline-decode".into())
        .spawn(move || {
            decode_loop(format, decoder, &worker_queue, &cmd_rx, generation, &messages);
            worker_queue.close();
            worker_latch.arrive();
        })
        .map_err(|e| {
            latch.arrive();
            anyhow!("spawn decode thread: {e}")
        })?;

    Ok(DecodedStream {
        spec,
        queue,
        duration_ms,
        commands: cmd_tx,
        seekable,
    })
}

/// Packet loop. Single-packet decode errors are skipped; a fatal format error
/// is posted (generation-tagged) and ends the stream.
fn decode_loop(
    mut format: Box<dyn FormatReader>,
    mut decoder: Box<dyn Decoder>,
    queue: &Arc<SampleQueue>,
    commands: &Receiver<DecoderCommand>,
    generation: u64,
    messages: &Sender<EngineMessage>,
) {
    loop {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                DecoderCommand::Seek { ms, downstream } => {
                    apply_seek(format.as_mut(), decoder.as_mut(), queue, &downstream, ms);
                }
            }
        }

        if queue.is_closed() {
            break;
        }

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                let _ = messages.send(EngineMessage::PipelineError {
                    generation,
                    message: format!("decode failed: {e}"),
                });
                break;
            }
        };

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!("skipping undecodable packet: {e}");
                continue;
            }
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        queue.push_blocking(sample_buf.samples());
    }
}

/// Accurate seek plus flush of everything decoded before the seek point.
/// The decoder's own queue and the downstream queue are both flushed here,
/// after the reader repositioned, never before.
fn apply_seek(
    format: &mut dyn FormatReader,
    decoder: &mut dyn Decoder,
    queue: &Arc<SampleQueue>,
    downstream: &Arc<SampleQueue>,
    ms: u64,
) {
    let time = Time::new(ms / 1000, (ms % 1000) as f64 / 1000.0);
    match format.seek(SeekMode::Accurate, SeekTo::Time { time, track_id: None }) {
        Ok(_) => {
            decoder.reset();
            queue.flush();
            if !Arc::ptr_eq(queue, downstream) {
                downstream.flush();
            }
        }
        Err(e) => tracing::warn!(ms, "seek failed, continuing from current position: {e}"),
    }
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_params(params: &CodecParameters) -> Option<u64> {
    let frames = params.n_frames?;
    let rate = params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::queue::PopStrategy;
    use crate::testutil::write_test_wav;

    #[test]
    fn seek_flushes_the_downstream_queue_after_repositioning() {
        let dir = std::env::temp_dir().join("tonearm-decoder-seek");
        std::fs::create_dir_all(&dir).unwrap();
        let wav = dir.join("seek.wav");
        write_test_wav(&wav, 16_000, 8_000, 1).unwrap();

        let latch = Arc::new(ShutdownLatch::new());
        let (tx, _rx) = crossbeam_channel::unbounded();
        let file = std::fs::File::open(&wav).unwrap();
        let stream = start_decoder(Box::new(file), Hint::new(), 1.0, 0, tx, latch).unwrap();

        // Stale audio a later stage already pushed toward the sink.
        let downstream = Arc::new(SampleQueue::new(1, 8_192));
        downstream.push_blocking(&[0.5; 1_024]);

        stream
            .commands
            .send(DecoderCommand::Seek {
                ms: 500,
                downstream: downstream.clone(),
            })
            .unwrap();

        // Keep draining the decoder so it reaches the command between
        // packets; the downstream flush is its doing, not ours.
        let deadline = Instant::now() + Duration::from_secs(10);
        while downstream.len_frames() > 0 {
            assert!(Instant::now() < deadline, "downstream never flushed");
            let _ = stream.queue.pop(PopStrategy::BlockingUpTo { max_frames: 1_024 });
        }

        stream.queue.close();
    }

    #[test]
    fn duration_from_params_computes_ms() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_params(&params), Some(2000));
    }

    #[test]
    fn duration_from_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_params(&params).is_none());
    }

    #[test]
    fn duration_from_params_requires_frame_count() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(44_100);
        assert!(duration_ms_from_params(&params).is_none());
    }
}
