//! Generation-backend clients with unified streaming support.
//!
//! # Architecture
//!
//! - [`GenerationClient`] - The trait the engine consumes: single-shot
//!   [`GenerationClient::generate`] and streaming
//!   [`GenerationClient::generate_streaming`].
//! - [`gemini`] - The Gemini multimodal GenerateContent client, the one real
//!   implementation.
//!
//! Streaming responses are normalized to [`FragmentEvent`]s sent through a
//! [`tokio::sync::mpsc::Sender`], allowing the caller to fold content as it
//! arrives.
//!
//! # Error Handling
//!
//! Backend errors during streaming are delivered as `FragmentEvent::Error`
//! events rather than `Err` returns, so partial output produced before the
//! error survives. Only low-level failures that prevent reading the HTTP
//! response stream return `Err`.

pub mod retry;
pub mod sse_types;

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use atelier_types::{
    FragmentEvent, GenerateError, GenerationSettings, HistoryEntry, MediaBlob, RawFragment,
};
use tokio::sync::mpsc;

pub mod gemini;

/// Canonical Gemini API base URL.
pub const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

// reqwest only exposes tcp_keepalive (idle time); interval/retries use
// platform defaults.
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// One generation call: prompt plus optional media attachments, issued
/// against a history snapshot with request-scoped settings.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub settings: GenerationSettings,
    pub prompt: String,
    pub attachments: Vec<MediaBlob>,
    pub history: Vec<HistoryEntry>,
}

/// The backend client surface the engine consumes.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Single-shot generation: the whole response as a fragment list.
    async fn generate(&self, request: &GenerateRequest)
    -> Result<Vec<RawFragment>, GenerateError>;

    /// Streaming generation. Fragments, completion, and most errors are
    /// delivered through `tx`; `Err` is reserved for failures that prevent
    /// reading the response stream at all.
    async fn generate_streaming(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<FragmentEvent>,
    ) -> Result<(), GenerateError>;
}

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!(
                "Failed to build hardened HTTP client: {e}. Attempting minimal hardened fallback."
            );
            reqwest::Client::builder()
                .https_only(true)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Minimal hardened HTTP client must build; cannot proceed without TLS")
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(true)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
}

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no event to emit
    Continue,
    /// Emit these events and continue
    Emit(Vec<FragmentEvent>),
    /// Stream is done (finishReason signalled success)
    Done,
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn backend_name(&self) -> &'static str;
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("ATELIER_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

pub(crate) async fn send_event(tx: &mpsc::Sender<FragmentEvent>, event: FragmentEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Process an SSE stream using a backend-specific parser.
///
/// Handles the common SSE processing logic:
/// - Timeout handling for idle streams
/// - Buffer management with size limits
/// - UTF-8 validation
/// - Event boundary detection
/// - `[DONE]` marker handling
/// - Parse error tracking with threshold
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<FragmentEvent>,
    idle_timeout: Duration,
) -> Result<(), GenerateError> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, FragmentEvent::Error("Stream idle timeout".to_string())).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| GenerateError::Stream(e.to_string()))?;
        buffer.extend_from_slice(&chunk);

        // Security: prevent unbounded buffer growth
        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                FragmentEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return Ok(());
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    FragmentEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return Ok(());
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                let _ = send_event(tx, FragmentEvent::Done).await;
                return Ok(());
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                let is_terminal = matches!(
                                    &event,
                                    FragmentEvent::Done | FragmentEvent::Error(_)
                                );
                                if !send_event(tx, event).await {
                                    return Ok(());
                                }
                                if is_terminal {
                                    return Ok(());
                                }
                            }
                        }
                        SseParseAction::Done => {
                            let _ = send_event(tx, FragmentEvent::Done).await;
                            return Ok(());
                        }
                        SseParseAction::Error(msg) => {
                            let _ = send_event(tx, FragmentEvent::Error(msg)).await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        backend = parser.backend_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            FragmentEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    // Premature EOF: connection closed without completion signal
    let _ = send_event(
        tx,
        FragmentEvent::Error("Connection closed before stream completed".to_string()),
    )
    .await;
    Ok(())
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

#[derive(Debug)]
pub(crate) enum ApiResponse {
    Success(reqwest::Response),
    StreamTerminated,
}

pub(crate) async fn handle_response(
    outcome: retry::RetryOutcome,
    tx: &mpsc::Sender<FragmentEvent>,
) -> ApiResponse {
    let response = match outcome {
        retry::RetryOutcome::Success(resp) | retry::RetryOutcome::HttpError(resp) => resp,
        retry::RetryOutcome::ConnectionError { attempts, source } => {
            let _ = send_event(
                tx,
                FragmentEvent::Error(format!(
                    "Request failed after {attempts} attempts: {source}"
                )),
            )
            .await;
            return ApiResponse::StreamTerminated;
        }
        retry::RetryOutcome::NonRetryable(e) => {
            let _ = send_event(tx, FragmentEvent::Error(format!("Request failed: {e}"))).await;
            return ApiResponse::StreamTerminated;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = read_capped_error_body(response).await;
        let _ = send_event(
            tx,
            FragmentEvent::Error(format!("API error {status}: {error_text}")),
        )
        .await;
        return ApiResponse::StreamTerminated;
    }

    ApiResponse::Success(response)
}
