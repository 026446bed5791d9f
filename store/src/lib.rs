//! Media lifecycle management.
//!
//! Large media generated during a conversation is moved out of in-memory
//! history into a SQLite-backed store, leaving a thumbnail and a stable
//! reference behind. [`store::MediaStore`] is the persistence layer;
//! [`offload`] holds the offload/resolve policy on top of it.

mod offload;
mod store;

pub use offload::{
    OFFLOAD_THRESHOLD_BYTES, OffloadOutcome, ResolvedMedia, offload_parts, offload_parts_with,
    resolve_media,
};
pub use store::{MediaRecord, MediaStore};
