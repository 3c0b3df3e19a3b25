use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tonearm", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Initial volume, percent (0-100)
    #[arg(long, default_value_t = 100)]
    pub volume: u8,

    /// Fade-out duration for a requested stop, in milliseconds (0 = instant)
    #[arg(long, default_value_t = 1000)]
    pub fadeout_ms: u64,

    /// Queue buffer target in seconds (per stage)
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Output callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local file or an http(s) URL
    Play {
        /// Path to an audio file, or a URL to fetch and play
        track: String,

        /// Start position in milliseconds (ignored for unseekable sources)
        #[arg(long, default_value_t = 0)]
        seek_ms: u64,
    },

    /// List output devices and exit
    Devices,
}
