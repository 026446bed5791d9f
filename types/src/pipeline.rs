//! Pipeline request and run types.

use serde::{Deserialize, Serialize};

use crate::model::ModelName;

/// How a multi-step request fans its steps out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Steps run strictly in order; each step's media output feeds the next.
    Serial,
    /// All steps run concurrently against the same initial attachments.
    Parallel,
    /// One task per (attachment, step) pair, attachment-major order.
    Combination,
}

/// One generation step. Immutable once built; the orchestrator only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationStep {
    pub prompt: String,
    /// Model to use for this step instead of the conversation's active model.
    pub model_override: Option<ModelName>,
}

impl GenerationStep {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_override: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: ModelName) -> Self {
        self.model_override = Some(model);
        self
    }
}

/// Raw media handed into a run as an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl MediaBlob {
    #[must_use]
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }
}

/// A complete pipeline run request.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub mode: PipelineMode,
    pub steps: Vec<GenerationStep>,
    pub attachments: Vec<MediaBlob>,
}

/// Progress of an in-flight run. `completed` counts finished tasks whether
/// they succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunProgress {
    pub completed: usize,
    pub total: usize,
}

/// Terminal state of a run that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}
