//! Chat gateway trait and OpenRouter HTTP implementation

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::types::{
    ChatMessage, ChatRequest, ChatResponse, Completion, CompletionParams, StreamChunk,
    StreamDelta,
};
use super::{ProviderError, ProviderResult};

/// Boxed stream of content deltas from a streaming completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = ProviderResult<StreamDelta>> + Send>>;

/// Prompt used for latency probes. Kept minimal so probes stay cheap.
const PROBE_PROMPT: &str = "Reply with the single word: ready";

/// Deadline for latency probes, independent of the board timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Abstraction over the chat-completions gateway.
///
/// The engine and the health manager talk to providers exclusively through
/// this trait, which keeps orchestration testable with scripted gateways.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Issue a chat completion and wait for the full response.
    async fn complete(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
        timeout: Duration,
    ) -> ProviderResult<Completion>;

    /// Issue a streaming chat completion, yielding content deltas as they
    /// arrive. The stream terminates after the delta carrying a finish
    /// reason.
    async fn complete_stream(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
        timeout: Duration,
    ) -> ProviderResult<DeltaStream>;

    /// Measure wall-clock latency of a minimal completion, in milliseconds.
    async fn probe_latency(&self, model_id: &str) -> ProviderResult<u64> {
        let start = Instant::now();
        let messages = [ChatMessage::user(PROBE_PROMPT)];
        self.complete(
            model_id,
            &messages,
            &CompletionParams {
                max_tokens: Some(8),
                temperature: Some(0.0),
            },
            PROBE_TIMEOUT,
        )
        .await?;
        Ok(start.elapsed().as_millis() as u64)
    }
}

/// HTTP client for an OpenRouter-compatible gateway.
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenRouterClient {
    /// Create a client against the given base URL (e.g.
    /// `https://openrouter.ai/api/v1`).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
        timeout: Duration,
        stream: bool,
    ) -> ProviderResult<reqwest::Response> {
        let request = ChatRequest {
            model: model_id,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream,
        };

        let sent = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = sent.status();
        if !status.is_success() {
            let body = sent.text().await.unwrap_or_default();
            warn!(model = model_id, status = status.as_u16(), "gateway error");
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(sent)
    }
}

#[async_trait]
impl ChatGateway for OpenRouterClient {
    async fn complete(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
        timeout: Duration,
    ) -> ProviderResult<Completion> {
        let response = self.send(model_id, messages, params, timeout, false).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let choice = parsed.choices.into_iter().next().ok_or(ProviderError::EmptyCompletion)?;

        debug!(
            model = model_id,
            tokens = parsed.usage.total_tokens,
            finish = choice.finish_reason.as_deref().unwrap_or("none"),
            "completion received"
        );

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice
                .message
                .reasoning_details
                .map(|v| v.to_string()),
            finish_reason: choice.finish_reason,
            usage: parsed.usage,
        })
    }

    async fn complete_stream(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
        timeout: Duration,
    ) -> ProviderResult<DeltaStream> {
        let response = self.send(model_id, messages, params, timeout, true).await?;
        Ok(Box::pin(sse_delta_stream(response)))
    }
}

/// State carried across polls of the SSE parser.
struct SseState {
    body: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: VecDeque<ProviderResult<StreamDelta>>,
    done: bool,
}

/// Parse a gateway event-stream body into content deltas.
///
/// Frames arrive as `data: {json}` lines terminated by `data: [DONE]`.
/// Anything that fails to parse surfaces as a `Malformed` item.
fn sse_delta_stream(
    response: reqwest::Response,
) -> impl Stream<Item = ProviderResult<StreamDelta>> + Send {
    let state = SseState {
        body: Box::pin(response.bytes_stream()),
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    drain_sse_lines(&mut state);
                }
                Some(Err(e)) => {
                    state.done = true;
                    state
                        .pending
                        .push_back(Err(ProviderError::Transport(e.to_string())));
                }
                None => {
                    state.done = true;
                }
            }
        }
    })
}

/// Pull complete lines out of the buffer and convert data frames to deltas.
fn drain_sse_lines(state: &mut SseState) {
    while let Some(newline) = state.buffer.find('\n') {
        let line: String = state.buffer.drain(..=newline).collect();
        let line = line.trim();

        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            state.done = true;
            continue;
        }

        match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => {
                if let Some(choice) = chunk.choices.into_iter().next() {
                    let finished = choice.finish_reason.is_some();
                    state.pending.push_back(Ok(StreamDelta {
                        content: choice.delta.content.unwrap_or_default(),
                        finish_reason: choice.finish_reason,
                    }));
                    if finished {
                        state.done = true;
                    }
                }
            }
            Err(e) => {
                state
                    .pending
                    .push_back(Err(ProviderError::Malformed(e.to_string())));
            }
        }
    }
}
