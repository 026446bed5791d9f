//! Gemini multimodal GenerateContent client.
//!
//! Talks to `{base}/models/{model}:streamGenerateContent?alt=sse` for
//! streaming and `{base}/models/{model}:generateContent` for single-shot
//! calls. Requests ask for both text and image output via
//! `responseModalities`; responses are normalized to [`RawFragment`]s.

use atelier_types::{
    ContentPart, FragmentEvent, GenerateError, HistoryEntry, InlineMedia, MediaData, PartSignature,
    RawFragment, Role,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};
use crate::sse_types::gemini as typed;
use crate::{
    ApiResponse, GEMINI_API_BASE_URL, GenerateRequest, GenerationClient, SseParseAction, SseParser,
    handle_response, http_client, process_sse_stream, read_capped_error_body, stream_idle_timeout,
};

/// The Gemini implementation of [`GenerationClient`].
#[derive(Debug, Clone)]
pub struct GeminiClient {
    base_url: String,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_url: GEMINI_API_BASE_URL.to_string(),
            client: http_client().clone(),
            retry_config: RetryConfig::default(),
        }
    }

    /// Client against a non-canonical endpoint (local proxies, test servers).
    ///
    /// Uses an unhardened HTTP client because such endpoints are typically
    /// plain-HTTP loopback addresses.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            retry_config: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        )
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }
}

fn text_part(text: &str) -> Value {
    json!({ "text": text })
}

fn inline_data_part(mime_type: &str, bytes: &[u8]) -> Value {
    json!({
        "inlineData": {
            "mimeType": mime_type,
            "data": BASE64.encode(bytes)
        }
    })
}

fn history_content(entry: &HistoryEntry) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    for part in &entry.parts {
        match part {
            ContentPart::Text(text) => {
                // Reasoning blocks are not replayed; only their signatures
                // carry continuation state.
                if text.reasoning {
                    continue;
                }
                let mut value = serde_json::Map::new();
                value.insert("text".into(), json!(text.text));
                if let Some(signature) = &text.signature {
                    value.insert("thoughtSignature".into(), json!(signature.as_str()));
                }
                parts.push(Value::Object(value));
            }
            ContentPart::Media(media) => {
                // Offloaded parts replay their thumbnail; the full-resolution
                // bytes stay in the media store.
                let bytes = match &media.data {
                    MediaData::Inline { bytes } => bytes.as_slice(),
                    MediaData::Offloaded { thumbnail, .. } => thumbnail.as_slice(),
                };
                if bytes.is_empty() {
                    continue;
                }
                parts.push(inline_data_part(&media.mime_type, bytes));
            }
        }
    }

    let role = match entry.role {
        Role::User => "user",
        Role::Model => "model",
    };
    json!({ "role": role, "parts": parts })
}

/// Build the GenerateContent request body.
///
/// Note: Gemini uses camelCase for `generationConfig` and `inlineData` but
/// lowercase for `contents`.
fn build_request_body(request: &GenerateRequest) -> Value {
    let mut contents: Vec<Value> = request.history.iter().map(history_content).collect();

    let mut user_parts = vec![text_part(&request.prompt)];
    for attachment in &request.attachments {
        user_parts.push(inline_data_part(&attachment.mime_type, &attachment.bytes));
    }
    contents.push(json!({ "role": "user", "parts": user_parts }));

    json!({
        "contents": contents,
        "generationConfig": {
            "responseModalities": ["TEXT", "IMAGE"],
            "temperature": 1.0
        }
    })
}

fn decode_inline_media(inline: &typed::InlineData) -> Option<InlineMedia> {
    let data = inline.data.as_deref()?;
    match BASE64.decode(data) {
        Ok(bytes) if !bytes.is_empty() => Some(InlineMedia {
            bytes,
            mime_type: inline
                .mime_type
                .clone()
                .unwrap_or_else(|| "image/png".to_string()),
        }),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(%e, "Dropping undecodable inline media payload");
            None
        }
    }
}

fn fragment_from_part(part: typed::Part) -> Option<RawFragment> {
    let media = part.inline_data.as_ref().and_then(decode_inline_media);
    let signature = part
        .thought_signature
        .filter(|s| !s.is_empty())
        .map(PartSignature::new);

    if part.text.is_none() && media.is_none() && signature.is_none() {
        return None;
    }

    Some(RawFragment {
        text: part.text,
        media,
        reasoning: part.thought,
        signature,
    })
}

/// Parser state for Gemini SSE streams.
#[derive(Default)]
struct GeminiParser;

impl SseParser for GeminiParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let response: typed::Response = match serde_json::from_value(json.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%e, "Failed to parse Gemini SSE event");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = response.error {
            return SseParseAction::Error(error.message_or_default().to_string());
        }

        let mut events = Vec::new();
        let mut finish_action: Option<SseParseAction> = None;

        if let Some(candidates) = response.candidates {
            for candidate in candidates {
                // Process content parts before the finish reason so final
                // content arriving alongside finishReason is not dropped.
                if let Some(content) = candidate.content
                    && let Some(parts) = content.parts
                {
                    for part in parts {
                        if let Some(fragment) = fragment_from_part(part) {
                            events.push(FragmentEvent::Fragment(fragment));
                        }
                    }
                }

                if let Some(reason_str) = candidate.finish_reason {
                    let reason = typed::FinishReason::parse(&reason_str);
                    if reason.is_success() {
                        finish_action = Some(SseParseAction::Done);
                    } else if let Some(msg) = reason.error_message() {
                        finish_action = Some(SseParseAction::Error(msg.to_string()));
                    }
                }
            }
        }

        if let Some(action) = finish_action {
            if events.is_empty() {
                return action;
            }
            match action {
                SseParseAction::Done => events.push(FragmentEvent::Done),
                SseParseAction::Error(msg) => events.push(FragmentEvent::Error(msg)),
                _ => {}
            }
            return SseParseAction::Emit(events);
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn backend_name(&self) -> &'static str {
        "Gemini"
    }
}

/// Flatten a single-shot response body into fragments.
fn collect_fragments(response: typed::Response) -> Result<Vec<RawFragment>, GenerateError> {
    if let Some(error) = response.error {
        return Err(GenerateError::Api {
            status: error.code.and_then(|c| u16::try_from(c).ok()).unwrap_or(0),
            message: error.message_or_default().to_string(),
        });
    }

    let mut fragments = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content
            && let Some(parts) = content.parts
        {
            fragments.extend(parts.into_iter().filter_map(fragment_from_part));
        }

        if let Some(reason_str) = candidate.finish_reason {
            let reason = typed::FinishReason::parse(&reason_str);
            if let Some(msg) = reason.error_message() {
                return Err(GenerateError::Api {
                    status: 0,
                    message: msg.to_string(),
                });
            }
        }
    }
    Ok(fragments)
}

#[async_trait::async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<Vec<RawFragment>, GenerateError> {
        let url = self.generate_url(request.settings.model.as_str());
        let body = build_request_body(request);
        let api_key = request.settings.api_key.expose_secret().to_string();

        let outcome = send_with_retry(
            || {
                self.client
                    .post(&url)
                    .header("x-goog-api-key", &api_key)
                    .header("content-type", "application/json")
                    .json(&body)
            },
            &self.retry_config,
        )
        .await;

        let response = match outcome {
            RetryOutcome::Success(resp) => resp,
            RetryOutcome::HttpError(resp) => {
                let status = resp.status().as_u16();
                let message = read_capped_error_body(resp).await;
                return Err(GenerateError::Api { status, message });
            }
            RetryOutcome::ConnectionError { attempts, source } => {
                return Err(GenerateError::Transport(format!(
                    "request failed after {attempts} attempts: {source}"
                )));
            }
            RetryOutcome::NonRetryable(e) => {
                return Err(GenerateError::Transport(e.to_string()));
            }
        };

        let parsed: typed::Response = response
            .json()
            .await
            .map_err(|e| GenerateError::Stream(format!("invalid response body: {e}")))?;

        collect_fragments(parsed)
    }

    async fn generate_streaming(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<FragmentEvent>,
    ) -> Result<(), GenerateError> {
        let url = self.stream_url(request.settings.model.as_str());
        let body = build_request_body(request);
        let api_key = request.settings.api_key.expose_secret().to_string();

        let outcome = send_with_retry(
            || {
                self.client
                    .post(&url)
                    .header("x-goog-api-key", &api_key)
                    .header("content-type", "application/json")
                    .json(&body)
            },
            &self.retry_config,
        )
        .await;

        let response = match handle_response(outcome, &tx).await {
            ApiResponse::Success(resp) => resp,
            ApiResponse::StreamTerminated => return Ok(()),
        };

        let mut parser = GeminiParser;
        process_sse_stream(response, &mut parser, &tx, stream_idle_timeout()).await
    }
}
