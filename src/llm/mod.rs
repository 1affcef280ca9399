//! Model providers
//!
//! - [`provider`]: the provider-agnostic contract and error type
//! - [`retry`]: bounded retries with exponential backoff
//! - [`ollama`]: adapter for an Ollama server
//! - [`scripted`]: replayed replies for tests and offline runs

pub mod ollama;
pub mod provider;
pub mod retry;
pub mod scripted;

pub use ollama::{OllamaConfig, OllamaProvider};
pub use provider::{AssistantReply, ModelProvider, ProviderError, TokenUsage};
pub use retry::{complete_with_retry, ProviderExhausted, RetryPolicy};
pub use scripted::{ScriptedProvider, ScriptedRequest};
