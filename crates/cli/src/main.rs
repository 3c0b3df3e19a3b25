//! Tonearm — a small CLI that plays a local file or a remote URL through the
//! streaming engine.
//!
//! The process owns the engine on the main thread and drives it with the
//! engine tick. Ctrl-C requests a fading stop; a second Ctrl-C (or a zero
//! fade-out) stops immediately.

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tonearm_engine::fade::TICK_INTERVAL_MS;
use tonearm_engine::{
    Engine, EngineConfig, EngineNotification, EngineState, Output, TrackRef, device,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match &args.cmd {
        cli::Command::Devices => {
            let host = cpal::default_host();
            device::list_devices(&host)
        }
        cli::Command::Play { track, seek_ms } => play(&args, track, *seek_ms),
    }
}

fn play(args: &cli::Args, track: &str, seek_ms: u64) -> Result<()> {
    let config = EngineConfig {
        output: Some(Output::Device {
            name: args.device.clone(),
        }),
        fadeout_ms: args.fadeout_ms,
        buffer_seconds: args.buffer_seconds,
        chunk_frames: args.chunk_frames,
        refill_max_frames: args.refill_max_frames,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config);
    engine.set_volume(args.volume);
    let notifications = engine.notifications();

    let stop_requested = Arc::new(AtomicBool::new(false));
    let stop_flag = stop_requested.clone();
    let _ = ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    });

    let track = if track.starts_with("http://") || track.starts_with("https://") {
        TrackRef::remote(track, false)
    } else {
        TrackRef::local(track)
    };

    engine.load(&track)?;
    if seek_ms > 0 {
        engine.seek(seek_ms);
    }
    engine.play()?;
    if let Some(duration) = engine.duration_ms() {
        tracing::info!(duration_ms = duration, "playing");
    }

    'run: loop {
        engine.tick();

        if stop_requested.swap(false, Ordering::SeqCst) {
            tracing::info!("stop requested");
            engine.stop();
        }

        for event in notifications.try_iter() {
            match event {
                EngineNotification::StateChanged(state) => tracing::info!(?state, "state"),
                EngineNotification::StatusText(text) => tracing::info!("{text}"),
                EngineNotification::TrackEnded => {
                    tracing::info!("track ended");
                    break 'run;
                }
                EngineNotification::VolumeChanged(volume) => {
                    tracing::debug!(volume, "volume")
                }
            }
        }

        if engine.state() == EngineState::Empty {
            break;
        }
        std::thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
    }
    Ok(())
}
