//! Incremental response fragments.
//!
//! The generation backend emits a sequence of fragments per response; the
//! part merger folds them into [`crate::ContentPart`]s.

use crate::part::PartSignature;

/// Inline media payload carried by a fragment (already base64-decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineMedia {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// One incremental unit of generated content.
///
/// A well-formed fragment carries text, media, or both; a fragment carrying
/// neither is a no-op unless it bears a signature for the preceding part.
#[derive(Debug, Clone, Default)]
pub struct RawFragment {
    pub text: Option<String>,
    pub media: Option<InlineMedia>,
    pub reasoning: bool,
    pub signature: Option<PartSignature>,
}

impl RawFragment {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            reasoning: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn media(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            media: Some(InlineMedia {
                bytes,
                mime_type: mime_type.into(),
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(PartSignature::new(signature));
        self
    }
}

/// Channel protocol between a provider stream and the accumulator.
#[derive(Debug, Clone)]
pub enum FragmentEvent {
    /// One content fragment.
    Fragment(RawFragment),
    /// Stream completed successfully.
    Done,
    /// Stream terminated with an error; partial output may precede this.
    Error(String),
}
