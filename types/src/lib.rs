//! Core domain types for Atelier.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer of the
//! application: content parts, raw fragments and the part merger, pipeline
//! step/run types, identifiers, model names, and the error taxonomy.

mod error;
mod fragment;
mod history;
mod ids;
mod merge;
mod model;
mod part;
mod pipeline;

pub use error::{GenerateError, PipelineError};
pub use fragment::{FragmentEvent, InlineMedia, RawFragment};
pub use history::{HistoryEntry, Role};
pub use ids::{ImageId, MessageId};
pub use merge::{merge_all, merge_fragment};
pub use model::{ApiKey, GenerationSettings, ModelName, ModelParseError};
pub use part::{ContentPart, MediaData, MediaPart, PartSignature, TextPart};
pub use pipeline::{
    GenerationStep, MediaBlob, PipelineMode, PipelineRequest, RunOutcome, RunProgress,
};
