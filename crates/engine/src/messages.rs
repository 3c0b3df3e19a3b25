//! Messages marshaled from pipeline/transfer threads to the engine.
//!
//! Callbacks fired by stage threads (end of stream, decode errors, transfer
//! progress) never touch engine state directly. They post one of these
//! messages instead; [`crate::Engine::tick`] drains them on the control
//! context. Every message carries the generation of the pipeline that
//! produced it so events from an already-destroyed pipeline can be ignored.

/// A marshaled event from a non-control thread.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EngineMessage {
    /// The sink drained the final queue after the producer closed it.
    EndOfStream { generation: u64 },
    /// A pipeline stage hit a runtime error. Reported, not fatal.
    PipelineError { generation: u64, message: String },
    /// Stream prebuffer progress, percent of the prebuffer threshold.
    Buffering { generation: u64, percent: u32 },
    /// The transfer job delivered all data.
    TransferFinished { generation: u64 },
    /// The transfer job failed; no automatic retry.
    TransferFailed { generation: u64, message: String },
    /// The streaming source drained below the low-water mark.
    SourceHasRoom { generation: u64 },
}

impl EngineMessage {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            EngineMessage::EndOfStream { generation }
            | EngineMessage::PipelineError { generation, .. }
            | EngineMessage::Buffering { generation, .. }
            | EngineMessage::TransferFinished { generation }
            | EngineMessage::TransferFailed { generation, .. }
            | EngineMessage::SourceHasRoom { generation } => *generation,
        }
    }
}
