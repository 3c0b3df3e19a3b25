use serde::{Deserialize, Serialize};

/// Coarse playback state of the audio engine.
///
/// The engine is created `Empty`, becomes `Idle` after a successful load,
/// toggles between `Playing` and `Paused`, and returns to `Empty` when the
/// pipeline is torn down.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No pipeline exists.
    #[default]
    Empty,
    /// A track is loaded and ready, but nothing is playing yet.
    Idle,
    /// Audio is being rendered.
    Playing,
    /// Playback is suspended; the pipeline is kept alive.
    Paused,
}

/// Notification emitted by the engine to its observers (UI, tray, scripting).
///
/// Observers receive these over a channel; delivery is "eventually, in
/// emission order". Observers never mutate engine state through this path.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineNotification {
    /// The engine state changed through an operation or an internal event.
    StateChanged(EngineState),
    /// Human-readable status line (buffering progress, error text).
    StatusText(String),
    /// The current track finished playing to the end.
    TrackEnded,
    /// The user volume changed (clamped percent, 0..=100).
    VolumeChanged(u8),
}

/// Reference to a playable track.
///
/// Immutable once a load begins: the engine never rewrites the URL or the
/// locality flags of a track it is playing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackRef {
    /// File path (local) or URL (remote).
    pub url: String,
    /// `true` when `url` is a local filesystem path.
    pub is_local: bool,
    /// `true` for inherently-streamed protocols (radio streams); those are
    /// fed by their own transport rather than a buffered transfer job.
    pub is_stream: bool,
}

impl TrackRef {
    /// A local file track.
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            url: path.into(),
            is_local: true,
            is_stream: false,
        }
    }

    /// A remote track fetched over the network.
    pub fn remote(url: impl Into<String>, is_stream: bool) -> Self {
        Self {
            url: url.into(),
            is_local: false,
            is_stream,
        }
    }
}
