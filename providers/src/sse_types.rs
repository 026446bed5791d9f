//! Typed SSE event structures for backend responses.
//!
//! Parse errors happen at the serde boundary, not scattered through parsing
//! logic. `#[serde(default)]` keeps optional fields tolerant of payload
//! evolution.

pub mod gemini {
    use serde::Deserialize;

    /// Top-level Gemini SSE response.
    ///
    /// Gemini has no event-type tagging; each SSE chunk is a complete
    /// response object with candidates.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Response {
        pub candidates: Option<Vec<Candidate>>,
        pub error: Option<ErrorInfo>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Candidate {
        pub content: Option<Content>,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Content {
        pub parts: Option<Vec<Part>>,
    }

    /// A content part in a Gemini response.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Part {
        /// Text content (absent for image parts)
        pub text: Option<String>,
        /// Whether this is thinking content
        #[serde(default)]
        pub thought: bool,
        /// Generated or echoed media (base64 payload)
        pub inline_data: Option<InlineData>,
        /// Continuation signature in thinking mode
        pub thought_signature: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct InlineData {
        pub mime_type: Option<String>,
        /// Base64-encoded bytes.
        pub data: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        pub message: Option<String>,
        pub code: Option<i32>,
    }

    impl ErrorInfo {
        #[must_use]
        pub fn message_or_default(&self) -> &str {
            self.message.as_deref().unwrap_or("Unknown error")
        }
    }

    /// Known Gemini finish reasons.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FinishReason {
        Stop,
        MaxTokens,
        Safety,
        Recitation,
        ProhibitedContent,
        ImageSafety,
        Other,
        Unknown,
    }

    impl FinishReason {
        #[must_use]
        pub fn parse(s: &str) -> Self {
            match s {
                "STOP" => Self::Stop,
                "MAX_TOKENS" => Self::MaxTokens,
                "SAFETY" => Self::Safety,
                "RECITATION" => Self::Recitation,
                "PROHIBITED_CONTENT" => Self::ProhibitedContent,
                "IMAGE_SAFETY" => Self::ImageSafety,
                "OTHER" => Self::Other,
                _ => Self::Unknown,
            }
        }

        #[must_use]
        pub fn is_success(self) -> bool {
            matches!(self, Self::Stop | Self::MaxTokens)
        }

        /// Error message if this is an error reason, `None` on success.
        #[must_use]
        pub fn error_message(self) -> Option<&'static str> {
            match self {
                Self::Stop | Self::MaxTokens | Self::Unknown => None,
                Self::Safety => Some("Content filtered by safety settings"),
                Self::Recitation => Some("Response blocked: recitation"),
                Self::ProhibitedContent => Some("Response blocked: prohibited content"),
                Self::ImageSafety => Some("Image filtered by safety settings"),
                Self::Other => Some("Generation stopped for an unspecified reason"),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::{FinishReason, Response};

        #[test]
        fn deserialize_text_chunk() {
            let json = r#"{
                "candidates": [{
                    "content": { "parts": [{ "text": "hello" }] }
                }]
            }"#;
            let response: Response = serde_json::from_str(json).unwrap();
            let candidates = response.candidates.unwrap();
            let parts = candidates[0].content.as_ref().unwrap().parts.as_ref().unwrap();
            assert_eq!(parts[0].text.as_deref(), Some("hello"));
            assert!(!parts[0].thought);
        }

        #[test]
        fn deserialize_thought_with_signature() {
            let json = r#"{
                "candidates": [{
                    "content": {
                        "parts": [{
                            "text": "considering...",
                            "thought": true,
                            "thoughtSignature": "sig-abc"
                        }]
                    }
                }]
            }"#;
            let response: Response = serde_json::from_str(json).unwrap();
            let candidates = response.candidates.unwrap();
            let parts = candidates[0].content.as_ref().unwrap().parts.as_ref().unwrap();
            assert!(parts[0].thought);
            assert_eq!(parts[0].thought_signature.as_deref(), Some("sig-abc"));
        }

        #[test]
        fn deserialize_inline_image() {
            let json = r#"{
                "candidates": [{
                    "content": {
                        "parts": [{
                            "inlineData": { "mimeType": "image/png", "data": "AAECAw==" }
                        }]
                    },
                    "finishReason": "STOP"
                }]
            }"#;
            let response: Response = serde_json::from_str(json).unwrap();
            let candidates = response.candidates.unwrap();
            let parts = candidates[0].content.as_ref().unwrap().parts.as_ref().unwrap();
            let inline = parts[0].inline_data.as_ref().unwrap();
            assert_eq!(inline.mime_type.as_deref(), Some("image/png"));
            assert_eq!(candidates[0].finish_reason.as_deref(), Some("STOP"));
        }

        #[test]
        fn deserialize_error_payload() {
            let json = r#"{ "error": { "message": "quota exhausted", "code": 429 } }"#;
            let response: Response = serde_json::from_str(json).unwrap();
            let error = response.error.unwrap();
            assert_eq!(error.message_or_default(), "quota exhausted");
            assert_eq!(error.code, Some(429));
        }

        #[test]
        fn finish_reason_classification() {
            assert!(FinishReason::parse("STOP").is_success());
            assert!(FinishReason::parse("MAX_TOKENS").is_success());
            assert!(FinishReason::parse("IMAGE_SAFETY").error_message().is_some());
            assert!(FinishReason::parse("SOMETHING_NEW").error_message().is_none());
        }
    }
}
