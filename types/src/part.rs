//! Content part domain model.
//!
//! A part is one unit of accumulated response content: either text or media,
//! each carrying a reasoning flag that distinguishes intermediate model
//! reasoning from final answer content.

use serde::{Deserialize, Serialize};

use crate::ids::ImageId;

/// Opaque continuation signature attached by the backend to a part.
///
/// Replayed verbatim on follow-up requests; the value is provider-owned and
/// never inspected. `Debug` is redacted - signatures are not meaningful (or
/// safe) to log.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartSignature(String);

impl PartSignature {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PartSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PartSignature(<{} bytes>)", self.0.len())
    }
}

/// A text part: an answer or reasoning block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
    pub reasoning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<PartSignature>,
}

/// Where a media part's bytes live.
///
/// Exactly one representation is authoritative at a time: inline full bytes
/// before offload, or a store reference plus thumbnail after. The sum type
/// makes the mixed state unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaData {
    /// Full-resolution bytes held inline (pre-offload).
    Inline { bytes: Vec<u8> },
    /// Full bytes persisted in the media store; the part keeps a thumbnail
    /// for display and `full_size` for conversation-limit accounting.
    Offloaded {
        id: ImageId,
        thumbnail: Vec<u8>,
        full_size: u64,
    },
}

impl MediaData {
    /// Raw (pre-compression, pre-offload) byte size of the media item.
    #[must_use]
    pub fn raw_size(&self) -> u64 {
        match self {
            MediaData::Inline { bytes } => bytes.len() as u64,
            MediaData::Offloaded { full_size, .. } => *full_size,
        }
    }

    #[must_use]
    pub fn is_offloaded(&self) -> bool {
        matches!(self, MediaData::Offloaded { .. })
    }
}

/// A media part (image output or attachment echo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPart {
    pub data: MediaData,
    pub mime_type: String,
    pub reasoning: bool,
    /// The prompt that produced this media, when known. Used for captioning
    /// and for re-running a single generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<PartSignature>,
}

/// One unit of content with a reasoning flag.
///
/// This is a real sum type; every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentPart {
    Text(TextPart),
    Media(MediaPart),
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextPart {
            text: text.into(),
            reasoning: false,
            signature: None,
        })
    }

    #[must_use]
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Text(TextPart {
            text: text.into(),
            reasoning: true,
            signature: None,
        })
    }

    #[must_use]
    pub fn inline_media(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::Media(MediaPart {
            data: MediaData::Inline { bytes },
            mime_type: mime_type.into(),
            reasoning: false,
            source_prompt: None,
            signature: None,
        })
    }

    #[must_use]
    pub fn is_reasoning(&self) -> bool {
        match self {
            ContentPart::Text(part) => part.reasoning,
            ContentPart::Media(part) => part.reasoning,
        }
    }

    #[must_use]
    pub fn as_media(&self) -> Option<&MediaPart> {
        match self {
            ContentPart::Media(part) => Some(part),
            ContentPart::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&TextPart> {
        match self {
            ContentPart::Text(part) => Some(part),
            ContentPart::Media(_) => None,
        }
    }

    /// Overwrite this part's continuation signature (last-write-wins).
    pub fn set_signature(&mut self, signature: PartSignature) {
        match self {
            ContentPart::Text(part) => part.signature = Some(signature),
            ContentPart::Media(part) => part.signature = Some(signature),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentPart, MediaData, PartSignature};
    use crate::ids::{ImageId, MessageId};

    #[test]
    fn raw_size_uses_full_size_after_offload() {
        let inline = MediaData::Inline {
            bytes: vec![0u8; 128],
        };
        assert_eq!(inline.raw_size(), 128);

        let offloaded = MediaData::Offloaded {
            id: ImageId::derive(MessageId::new(1), 0),
            thumbnail: vec![0u8; 16],
            full_size: 128,
        };
        assert_eq!(offloaded.raw_size(), 128);
    }

    #[test]
    fn signature_debug_is_redacted() {
        let sig = PartSignature::new("super-secret-continuation-token");
        let rendered = format!("{sig:?}");
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn set_signature_overwrites() {
        let mut part = ContentPart::text("hello");
        part.set_signature(PartSignature::new("a"));
        part.set_signature(PartSignature::new("b"));
        let text = part.as_text().unwrap();
        assert_eq!(text.signature.as_ref().unwrap().as_str(), "b");
    }
}
