//! Bounded retries with exponential backoff for model calls

use std::time::{Duration, Instant};

use tracing::{info_span, warn, Instrument};

use super::provider::{AssistantReply, ModelProvider, ProviderError};
use crate::conversation::Message;
use crate::metrics::{LLM_CALL_DURATION, LLM_RETRIES};
use crate::tools::ToolSchema;

/// How often and how patiently to retry
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// No retries, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// Every attempt failed (or the failure was not retryable)
#[derive(Debug, thiserror::Error)]
#[error("model provider failed after {attempts} attempt(s): {last}")]
pub struct ProviderExhausted {
    pub attempts: u32,
    #[source]
    pub last: ProviderError,
}

/// Call the provider until it answers, a non-retryable error occurs, or attempts run out
pub async fn complete_with_retry(
    provider: &dyn ModelProvider,
    policy: &RetryPolicy,
    messages: &[Message],
    tools: &[ToolSchema],
) -> Result<AssistantReply, ProviderExhausted> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let span = info_span!("llm_call", provider = provider.name(), attempt, messages = messages.len());
        let start = Instant::now();
        let result = provider.complete(messages, tools).instrument(span).await;
        LLM_CALL_DURATION
            .with_label_values(&[provider.name()])
            .observe(start.elapsed().as_secs_f64());

        let error = match result {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= max_attempts {
            return Err(ProviderExhausted {
                attempts: attempt,
                last: error,
            });
        }

        let mut delay = policy.delay_for(attempt);
        if let ProviderError::RateLimited {
            retry_after: Some(hint),
        } = &error
        {
            delay = delay.max(*hint).min(policy.max_delay);
        }
        warn!(provider = provider.name(), attempt, error = %error, delay_ms = delay.as_millis() as u64, "Model call failed, retrying");
        LLM_RETRIES.with_label_values(&[provider.name()]).inc();
        tokio::time::sleep(delay).await;
    }
}
