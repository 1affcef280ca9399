//! Agent Loop - think/act/observe state machine for one user turn
//!
//! ```text
//!            user message
//!                 │
//!                 ▼
//!   ┌────────► THINKING ── reply without tool calls ──► DONE
//!   │             │
//!   │             │ reply with tool calls
//!   │             ▼
//!   │          ACTING      dispatch calls (independent ones concurrently)
//!   │             │
//!   │             ▼
//!   └──────── OBSERVING    append results in call order
//!
//!   iteration cap reached ──► ABORTED (partial answer + limit marker)
//! ```
//!
//! A turn works on a scratch copy of the history. The copy replaces the
//! session history only when the turn ends in DONE or ABORTED; a failed or
//! cancelled turn leaves the history exactly as it was.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::events::{EventSink, TraceEvent};
use crate::conversation::{History, Message, ToolCall, ToolResult};
use crate::llm::{complete_with_retry, ModelProvider, ProviderExhausted, RetryPolicy, TokenUsage};
use crate::metrics::{AGENT_ITERATIONS, AGENT_TURNS};
use crate::tools::{DispatchError, ToolContext, ToolRegistry};

/// Default system prompt for the code execution agent
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant with access to a Python sandbox.

Use the run_code tool whenever you need to:
- Calculate something or verify a result
- Load, transform or analyse data
- Draw a chart (matplotlib and plotly figures are captured automatically)

Guidelines:
- Variables, imports and functions persist between run_code calls in this conversation
- If code fails, read the error and fix it instead of guessing
- When the task is complete, answer in plain text without calling tools"#;

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum think/act/observe cycles per user turn
    pub max_iterations: usize,
    /// Custom system prompt (default prompt if None, no prompt if empty)
    pub system_prompt: Option<String>,
    /// Dispatch independent tool calls of one step concurrently
    pub parallel_tool_calls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            system_prompt: None,
            parallel_tool_calls: true,
        }
    }
}

/// States of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Thinking,
    Acting,
    Observing,
    Done,
    Aborted,
}

/// Terminal state of a completed turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model produced a final answer
    Done { answer: String },
    /// The iteration cap was reached
    Aborted {
        /// Last assistant text seen before the cap, if any
        partial: Option<String>,
        /// Final assistant message appended to history (partial + limit marker)
        message: String,
    },
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Done { .. } => "done",
            TurnOutcome::Aborted { .. } => "aborted",
        }
    }

    /// Text to show the user
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Done { answer } => answer,
            TurnOutcome::Aborted { message, .. } => message,
        }
    }

    pub fn final_state(&self) -> LoopState {
        match self {
            TurnOutcome::Done { .. } => LoopState::Done,
            TurnOutcome::Aborted { .. } => LoopState::Aborted,
        }
    }
}

/// Summary of a committed turn
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: String,
    pub outcome: TurnOutcome,
    /// Think/act/observe cycles used
    pub iterations: usize,
    pub tool_calls: usize,
    pub usage: TokenUsage,
    /// Messages this turn added, starting with the user message
    pub appended: Vec<Message>,
}

/// Turn-level failures shown to the user
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("turn cancelled")]
    Cancelled,
    #[error("the code sandbox is unavailable: {0}")]
    SandboxUnavailable(#[from] DispatchError),
    #[error(transparent)]
    ProviderExhausted(#[from] ProviderExhausted),
}

impl TurnError {
    fn metric_label(&self) -> &'static str {
        match self {
            TurnError::Cancelled => "cancelled",
            TurnError::SandboxUnavailable(_) | TurnError::ProviderExhausted(_) => "failed",
        }
    }
}

/// Drives turns for any number of sessions; holds no per-session state
pub struct AgentLoop {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
    retry: RetryPolicy,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one user turn to DONE or ABORTED
    ///
    /// `history` is only modified when the turn completes. Cancelling `cancel`
    /// abandons the turn at its next suspension point.
    pub async fn run_turn(
        &self,
        session_id: &str,
        history: &mut History,
        user_message: Message,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        let turn_id = Uuid::now_v7().to_string();
        let span = info_span!(
            "agent_turn",
            session_id,
            turn_id = %turn_id,
            provider = self.provider.name(),
            otel.name = "agent_turn"
        );

        let mut scratch = history.clone();
        events.emit(TraceEvent::TurnStarted {
            turn_id: turn_id.clone(),
        });

        let result = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TurnError::Cancelled),
                result = self.drive(&turn_id, session_id, &mut scratch, user_message, events, cancel) => result,
            }
        }
        .instrument(span.clone())
        .await;

        let _enter = span.enter();
        match result {
            Ok(report) => {
                *history = scratch;
                AGENT_TURNS.with_label_values(&[report.outcome.as_str()]).inc();
                AGENT_ITERATIONS.observe(report.iterations as f64);
                info!(
                    outcome = report.outcome.as_str(),
                    iterations = report.iterations,
                    tool_calls = report.tool_calls,
                    tokens = report.usage.total(),
                    "Turn completed"
                );
                events.emit(TraceEvent::TurnFinished {
                    turn_id,
                    outcome: report.outcome.as_str(),
                    iterations: report.iterations,
                    answer: report.outcome.text().to_string(),
                });
                Ok(report)
            }
            Err(TurnError::Cancelled) => {
                AGENT_TURNS.with_label_values(&["cancelled"]).inc();
                info!("Turn cancelled");
                events.emit(TraceEvent::TurnCancelled { turn_id });
                Err(TurnError::Cancelled)
            }
            Err(error) => {
                AGENT_TURNS.with_label_values(&[error.metric_label()]).inc();
                warn!(error = %error, "Turn failed");
                events.emit(TraceEvent::TurnFailed {
                    turn_id,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        turn_id: &str,
        session_id: &str,
        history: &mut History,
        user_message: Message,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        self.inject_system_prompt(history);
        let base = history.len();
        append(history, events, turn_id, user_message);

        let schemas = self.tools.schemas();
        let ctx = ToolContext {
            session_id: session_id.to_string(),
            cancel: cancel.child_token(),
        };

        let mut usage = TokenUsage::default();
        let mut last_text: Option<String> = None;
        let mut tool_calls = 0;
        let mut iteration = 0;

        let outcome = loop {
            if iteration >= self.config.max_iterations {
                let marker = format!(
                    "[iteration limit reached after {} cycles; the answer may be incomplete]",
                    self.config.max_iterations
                );
                let message = match &last_text {
                    Some(partial) => format!("{}\n\n{}", partial, marker),
                    None => marker,
                };
                warn!(iterations = iteration, "Max iterations reached");
                self.set_state(events, turn_id, LoopState::Aborted, iteration);
                append(
                    history,
                    events,
                    turn_id,
                    Message::assistant(message.clone(), Vec::new()),
                );
                break TurnOutcome::Aborted {
                    partial: last_text,
                    message,
                };
            }
            iteration += 1;

            // THINKING
            self.set_state(events, turn_id, LoopState::Thinking, iteration);
            let reply =
                complete_with_retry(self.provider.as_ref(), &self.retry, history.messages(), &schemas)
                    .await?;

            if let Some(call_usage) = reply.usage {
                usage.add(call_usage);
                events.emit(TraceEvent::Usage {
                    turn_id: turn_id.to_string(),
                    call: call_usage,
                    turn_total: usage,
                });
            }
            if !reply.text.trim().is_empty() {
                last_text = Some(reply.text.clone());
            }

            let is_final = reply.is_final();
            let calls = reply.tool_calls;
            append(
                history,
                events,
                turn_id,
                Message::assistant(reply.text.clone(), calls.clone()),
            );

            if is_final {
                self.set_state(events, turn_id, LoopState::Done, iteration);
                break TurnOutcome::Done { answer: reply.text };
            }

            // ACTING
            self.set_state(events, turn_id, LoopState::Acting, iteration);
            tool_calls += calls.len();
            let results = self.act(&ctx, &calls, events, turn_id).await?;

            // OBSERVING
            self.set_state(events, turn_id, LoopState::Observing, iteration);
            for result in results {
                for artifact in &result.artifacts {
                    events.emit(TraceEvent::ArtifactAvailable {
                        turn_id: turn_id.to_string(),
                        call_id: result.call_id.clone(),
                        artifact: artifact.clone(),
                    });
                }
                append(history, events, turn_id, Message::tool(result));
            }
        };

        Ok(TurnReport {
            turn_id: turn_id.to_string(),
            outcome,
            iterations: iteration,
            tool_calls,
            usage,
            appended: history.since(base).to_vec(),
        })
    }

    /// Dispatch one step's calls; results come back in call order
    ///
    /// Independent calls run concurrently with each other and with the
    /// chain of non-independent calls, which run one after another.
    async fn act(
        &self,
        ctx: &ToolContext,
        calls: &[ToolCall],
        events: &EventSink,
        turn_id: &str,
    ) -> Result<Vec<ToolResult>, TurnError> {
        let (concurrent, sequential): (Vec<usize>, Vec<usize>) = (0..calls.len())
            .partition(|&i| self.config.parallel_tool_calls && self.tools.is_independent(&calls[i].name));

        let chain = async {
            let mut done = Vec::with_capacity(sequential.len());
            for &i in &sequential {
                done.push((i, self.dispatch_one(ctx, &calls[i], events, turn_id).await));
            }
            done
        };
        let fan_out = join_all(concurrent.iter().map(|&i| async move {
            (i, self.dispatch_one(ctx, &calls[i], events, turn_id).await)
        }));

        let (chained, fanned) = tokio::join!(chain, fan_out);

        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        for (i, result) in chained.into_iter().chain(fanned) {
            slots[i] = Some(result?);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    async fn dispatch_one(
        &self,
        ctx: &ToolContext,
        call: &ToolCall,
        events: &EventSink,
        turn_id: &str,
    ) -> Result<ToolResult, TurnError> {
        events.emit(TraceEvent::ToolCallStarted {
            turn_id: turn_id.to_string(),
            call: call.clone(),
        });
        let result = self.tools.dispatch(ctx, call).await?;
        events.emit(TraceEvent::ToolCallFinished {
            turn_id: turn_id.to_string(),
            result: result.clone(),
        });
        Ok(result)
    }

    fn inject_system_prompt(&self, history: &mut History) {
        if history.starts_with_system() {
            return;
        }
        let prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        if prompt.is_empty() {
            return;
        }
        let mut with_prompt = History::new();
        with_prompt.push(Message::system(prompt));
        with_prompt.extend(history.messages().iter().cloned());
        *history = with_prompt;
    }

    fn set_state(&self, events: &EventSink, turn_id: &str, state: LoopState, iteration: usize) {
        events.emit(TraceEvent::StateChanged {
            turn_id: turn_id.to_string(),
            state,
            iteration,
        });
    }
}

fn append(history: &mut History, events: &EventSink, turn_id: &str, message: Message) {
    events.emit(TraceEvent::MessageAppended {
        turn_id: turn_id.to_string(),
        message: message.clone(),
    });
    history.push(message);
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("provider", &self.provider.name())
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish()
    }
}
