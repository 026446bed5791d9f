//! The generation engine: streaming accumulation, payload governance, and
//! pipeline orchestration.
//!
//! # Architecture
//!
//! - [`accumulator`] - Folds a cancellable fragment stream into content
//!   parts, tracking reasoning duration for display.
//! - [`governor`] - Keeps outgoing payloads within backend limits (per-image
//!   compression) and detects when a conversation must be restarted.
//! - [`pipeline`] - The orchestrator: serial, parallel, and combination
//!   multi-step runs over a [`atelier_providers::GenerationClient`].
//! - [`collaborators`] - The surfaces the orchestrator drives but does not
//!   own: conversation storage, account/quota, user notification.

pub mod accumulator;
pub mod collaborators;
pub mod governor;
pub mod pipeline;

pub use accumulator::{FinalResponse, ResponseAccumulator, Snapshot, StreamStep, accumulate_complete};
pub use collaborators::{AccountClient, ConversationStore, InMemoryConversation, Notifier, Severity};
pub use governor::{GovernorLimits, LimitVerdict, check_conversation_limit, compress_history};
pub use pipeline::PipelineRunner;
