//! Deterministic provider that replays a fixed script
//!
//! Used by tests and offline demos. Each `complete` call takes the next step
//! of the script; once it runs out, the `repeat` reply (if any) is returned
//! forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::provider::{AssistantReply, ModelProvider, ProviderError};
use crate::conversation::Message;
use crate::tools::ToolSchema;

/// What the provider saw on one call
#[derive(Debug, Clone)]
pub struct ScriptedRequest {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Result<AssistantReply, ProviderError>>>,
    repeat: Option<AssistantReply>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ScriptedRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, reply: AssistantReply) -> Self {
        self.push(Ok(reply))
    }

    pub fn fail(self, error: ProviderError) -> Self {
        self.push(Err(error))
    }

    /// Reply returned once the script is exhausted
    pub fn repeat(mut self, reply: AssistantReply) -> Self {
        self.repeat = Some(reply);
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, step: Result<AssistantReply, ProviderError>) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ScriptedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<AssistantReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ScriptedRequest {
                messages: messages.to_vec(),
                tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match step {
            Some(step) => step,
            None => self
                .repeat
                .clone()
                .ok_or_else(|| ProviderError::InvalidResponse("script exhausted".into())),
        }
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("calls", &self.calls())
            .finish()
    }
}
