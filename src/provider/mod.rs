//! Provider client for the external model gateway
//!
//! Issues chat completions and latency probes against an OpenRouter-shaped
//! HTTP API. Failures are classified as transient (retryable by the caller)
//! or permanent (surfaced immediately). The client itself never retries;
//! retry policy belongs to the engine.

pub mod client;
pub mod types;

pub use client::{ChatGateway, DeltaStream, OpenRouterClient};
pub use types::{
    ChatMessage, ChatRole, Completion, CompletionParams, StreamDelta, Usage,
};

use std::time::Duration;

/// Error type for provider operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("completion contained no choices")]
    EmptyCompletion,
}

impl ProviderError {
    /// Whether the caller may retry this failure.
    ///
    /// 429, 5xx, and network-level failures are transient; 4xx (other than
    /// 429) and malformed payloads are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Malformed(_) | Self::EmptyCompletion => false,
        }
    }

    /// Stable failure kind for the engine's error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            _ if self.is_transient() => "provider_transient",
            _ => "provider_permanent",
        }
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;
