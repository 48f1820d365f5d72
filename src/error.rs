use thiserror::Error;

/// Failures handled inside the pipeline
///
/// None of these are returned to the caller as `Err`. They show up as the
/// `error` field of a [`FrameResult`](crate::pipeline::FrameResult) or are
/// logged while the recovery state machine picks the next mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Context unreachable or the model failed to load
    #[error("initialization failed: {0}")]
    InitFailure(String),

    /// No result arrived before the frame deadline
    #[error("frame {sequence_id} timed out")]
    FrameTimeout { sequence_id: u64 },

    /// The context reported a failure for a frame
    #[error("frame {sequence_id} failed: {message}")]
    FrameError { sequence_id: u64, message: String },

    /// The channel to the context failed (crash, closed, unsupported call)
    #[error("execution context lost: {0}")]
    ContextLost(String),

    /// A required platform capability is missing
    #[error("capability unsupported: {0}")]
    CapabilityUnsupported(String),

    /// The pipeline was disposed while the frame was pending
    #[error("pipeline disposed")]
    Disposed,
}

/// Errors raised while constructing an execution context
#[derive(Debug, Error)]
pub enum ContextError {
    /// The platform cannot host an isolated context at all; retrying is pointless
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("failed to spawn execution context: {0}")]
    Spawn(#[from] std::io::Error),
}
