//! Error taxonomy shared across the workspace.

use thiserror::Error;

/// Terminal errors of a pipeline run.
///
/// Individual task failures in parallel and combination modes are not errors
/// at this level; they surface as inline markers in the result parts.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A single generation call failed before producing usable content.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The run's cancellation token was tripped.
    #[error("pipeline cancelled")]
    Cancelled,

    /// A serial step failed hard; later steps were not attempted.
    #[error("pipeline aborted at step {step}: {message}")]
    PipelineAborted { step: usize, message: String },

    /// A run is already active; the new request was not queued.
    #[error("a pipeline run is already in progress")]
    Busy,

    /// The conversation crossed both the message-count and image-byte
    /// limits; the caller must start a new conversation.
    #[error(
        "conversation limit exceeded ({message_count} messages, {image_size_mb:.1} MB of images)"
    )]
    ConversationLimitExceeded {
        message_count: usize,
        image_size_mb: f64,
    },
}

/// Errors from the generation backend client.
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("response stream error: {0}")]
    Stream(String),
}
