//! Streaming audio engine: one pipeline, one track, driven by a control tick.
//!
//! Local files and remote URLs decode through Symphonia into a staged
//! pipeline (decode, optional resample, output) whose end is either a CPAL
//! device stream or a paced null sink. Remote tracks are fed through a
//! fixed-size stream buffer by an HTTP transfer job with high/low-water
//! backpressure. The [`Engine`] facade owns it all; see its docs for the
//! threading model.

pub(crate) mod buffer;
pub mod config;
pub mod device;
mod engine;
pub mod fade;
mod messages;
mod pipeline;
pub mod queue;
pub mod scope;
pub(crate) mod transfer;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{EngineConfig, Output};
pub use engine::{Engine, StreamDataSink};
pub use scope::SCOPE_SIZE;
pub use tonearm_engine_types::{EngineNotification, EngineState, TrackRef};
