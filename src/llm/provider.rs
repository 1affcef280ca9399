//! Provider-agnostic model interface
//!
//! The agent loop only knows this contract: given the conversation so far
//! and the declared tools, return one assistant reply that is either a final
//! answer or a list of tool calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::{Message, ToolCall};
use crate::tools::ToolSchema;

/// Tokens consumed by one model call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// One assistant message as returned by a provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl AssistantReply {
    /// Final answer without tool calls
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            usage: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// Model call failures
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient failures worth another attempt
    ///
    /// Client errors other than 429 (bad request, auth) will fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::InvalidResponse(_) => true,
            ProviderError::Status { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
        }
    }
}

/// A language model backend
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logs and metric labels
    fn name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<AssistantReply, ProviderError>;
}
