//! Wire types for the chat-completions gateway
//!
//! Request and response shapes follow the OpenAI-compatible schema the
//! gateway exposes: `{model, messages, max_tokens?, temperature?, stream?}`
//! in, `{choices: [{message, finish_reason}], usage}` out.

use serde::{Deserialize, Serialize};

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Optional sampling parameters for a completion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Token accounting reported by the gateway
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A finished chat completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Assistant message content.
    pub content: String,
    /// Reasoning trace, when the model exposes one.
    pub reasoning: Option<String>,
    /// Finish reason as reported by the gateway (`stop`, `length`, ...).
    pub finish_reason: Option<String>,
    /// Token usage for the call.
    pub usage: Usage,
}

/// One content delta from a streaming completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Content fragment, possibly empty on the terminating delta.
    pub content: String,
    /// Set on the final delta of the stream.
    pub finish_reason: Option<String>,
}

// Raw wire shapes, private to the provider module.

#[derive(Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Deserialize)]
pub(crate) struct ChatResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ResponseMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_details: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub(crate) struct StreamChunk {
    pub choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
pub(crate) struct StreamChoice {
    #[serde(default)]
    pub delta: DeltaMessage,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
pub(crate) struct DeltaMessage {
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_omits_empty_fields() {
        let messages = vec![ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "openai/gpt-4o",
            messages: &messages,
            max_tokens: None,
            temperature: None,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("stream").is_none());
        assert_eq!(json["model"], "openai/gpt-4o");
    }

    #[test]
    fn test_response_parsing() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(parsed.usage.total_tokens, 4);
        assert_eq!(
            parsed.choices[0].finish_reason.as_deref(),
            Some("stop")
        );
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let raw = serde_json::json!({
            "choices": [{"delta": {"content": "tok"}, "finish_reason": null}]
        });
        let parsed: StreamChunk = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("tok"));
    }
}
