//! Engine configuration.
//!
//! The engine reads this at operation time and never persists it; the
//! surrounding application owns storage and editing.

/// Where rendered audio goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    /// A CPAL output device, optionally selected by name substring.
    Device { name: Option<String> },
    /// A paced sink that renders and discards audio. Used by tests and
    /// headless runs; fade, tap, and volume behave exactly as with a device.
    Null,
}

/// Tuning and output selection for the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Output selection. `None` means no output is configured and every load
    /// fails with a user-facing status message.
    pub output: Option<Output>,
    /// Fade-out duration for smooth stop, in milliseconds. Zero means an
    /// instant stop.
    pub fadeout_ms: u64,
    /// Target buffer duration per stage queue.
    pub buffer_seconds: f32,
    /// Decoder/resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per sink refill.
    pub refill_max_frames: usize,
    /// Scheduling priority label for the pipeline threads. Logged at load;
    /// actual scheduling is left to the OS.
    pub thread_priority: i32,
}

impl Default for EngineConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            output: Some(Output::Device { name: None }),
            fadeout_ms: 1_000,
            buffer_seconds: 2.0,
            chunk_frames: 1024,
            refill_max_frames: 4096,
            thread_priority: 0,
        }
    }
}
