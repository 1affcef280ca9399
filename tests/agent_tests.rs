//! Integration tests for the agent loop
//!
//! The model is scripted and sandboxes run on the in-memory runtime, so
//! these tests exercise the full think/act/observe flow without Ollama or
//! an interpreter.

mod support;

use std::sync::Arc;
use std::time::Duration;

use agentbox::agent::{
    AgentConfig, EventSink, LoopState, SessionEvent, TraceEvent, TurnError, TurnOutcome,
};
use agentbox::conversation::{History, Message, Role, ToolCall, ToolErrorKind, ToolResult};
use agentbox::llm::{AssistantReply, ProviderError, RetryPolicy, ScriptedProvider, TokenUsage};
use agentbox::tools::{Tool, RUN_CODE_TOOL};
use agentbox::AgentLoop;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use support::{agent, registry, sandbox_manager, FakeRuntime, SleepTool};

fn run_code(id: &str, code: &str) -> ToolCall {
    ToolCall::new(id, RUN_CODE_TOOL, json!({ "code": code }))
}

fn sleep_echo(id: &str, label: &str, ms: u64) -> ToolCall {
    ToolCall::new(id, SleepTool::NAME, json!({ "label": label, "ms": ms }))
}

fn tool_results(history: &History) -> Vec<&ToolResult> {
    history
        .messages()
        .iter()
        .filter_map(|m| m.tool_result())
        .collect()
}

async fn run(
    agent: &AgentLoop,
    history: &mut History,
    text: &str,
) -> Result<agentbox::agent::TurnReport, TurnError> {
    agent
        .run_turn(
            "s1",
            history,
            Message::user(text),
            &EventSink::disabled("s1"),
            &CancellationToken::new(),
        )
        .await
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<TraceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    events
}

#[tokio::test]
async fn test_state_persists_across_turns() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls("", vec![run_code("c1", "x = 42")]))
            .reply(AssistantReply::text("stored"))
            .reply(AssistantReply::with_tool_calls("", vec![run_code("c2", "print(x)")]))
            .reply(AssistantReply::text("x is 42")),
    );
    let sandboxes = sandbox_manager(FakeRuntime::new());
    let agent = agent(provider, registry(sandboxes, Vec::new()), AgentConfig::default());

    let mut history = History::new();
    run(&agent, &mut history, "remember 42").await.unwrap();
    let report = run(&agent, &mut history, "what was it?").await.unwrap();

    assert_eq!(report.outcome, TurnOutcome::Done { answer: "x is 42".into() });
    let results = tool_results(&history);
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].output, "42");
    assert!(!results[1].is_error());
}

#[tokio::test]
async fn test_results_follow_call_order_not_completion_order() {
    let sleep = SleepTool::new();
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls(
                "",
                vec![
                    sleep_echo("a", "A", 60),
                    sleep_echo("b", "B", 120),
                    sleep_echo("c", "C", 5),
                ],
            ))
            .reply(AssistantReply::text("done")),
    );
    let sandboxes = sandbox_manager(FakeRuntime::new());
    let tools = registry(sandboxes, vec![sleep.clone() as Arc<dyn Tool>]);
    let agent = agent(provider, tools, AgentConfig::default());

    let mut history = History::new();
    let started = std::time::Instant::now();
    run(&agent, &mut history, "go").await.unwrap();

    assert_eq!(sleep.finished(), vec!["C", "A", "B"]);
    let ids: Vec<&str> = tool_results(&history)
        .iter()
        .map(|r| r.call_id.as_str())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    // Ran concurrently: well under the 185ms a sequential dispatch would take
    assert!(started.elapsed() < Duration::from_millis(180));
}

#[tokio::test]
async fn test_sequential_dispatch_when_parallelism_disabled() {
    let sleep = SleepTool::new();
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls(
                "",
                vec![sleep_echo("a", "A", 30), sleep_echo("b", "B", 5)],
            ))
            .reply(AssistantReply::text("done")),
    );
    let tools = registry(
        sandbox_manager(FakeRuntime::new()),
        vec![sleep.clone() as Arc<dyn Tool>],
    );
    let config = AgentConfig {
        parallel_tool_calls: false,
        ..Default::default()
    };
    let agent = agent(provider, tools, config);

    let mut history = History::new();
    run(&agent, &mut history, "go").await.unwrap();
    assert_eq!(sleep.finished(), vec!["A", "B"]);
}

#[tokio::test]
async fn test_loop_aborts_at_iteration_cap() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls(
                "still working",
                vec![run_code("c0", "x = 1")],
            ))
            .repeat(AssistantReply::with_tool_calls("", vec![run_code("cn", "x = 1")])),
    );
    let config = AgentConfig {
        max_iterations: 3,
        ..Default::default()
    };
    let agent = agent(
        provider.clone(),
        registry(sandbox_manager(FakeRuntime::new()), Vec::new()),
        config,
    );

    let mut history = History::new();
    let report = run(&agent, &mut history, "loop forever").await.unwrap();

    assert_eq!(report.iterations, 3);
    assert_eq!(provider.calls(), 3);
    match &report.outcome {
        TurnOutcome::Aborted { partial, message } => {
            assert_eq!(partial.as_deref(), Some("still working"));
            assert!(message.starts_with("still working\n\n"));
            assert!(message.contains("[iteration limit reached after 3 cycles"));
        }
        other => panic!("expected abort, got {:?}", other),
    }
    let last = history.last().unwrap();
    assert_eq!(last.role(), Role::Assistant);
    assert!(last.text_content().contains("iteration limit reached"));
}

#[tokio::test]
async fn test_invalid_arguments_are_observed_and_loop_continues() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls(
                "",
                vec![ToolCall::new("bad", RUN_CODE_TOOL, json!({ "source": "x = 1" }))],
            ))
            .reply(AssistantReply::with_tool_calls("", vec![run_code("good", "x = 1")]))
            .reply(AssistantReply::text("fixed it")),
    );
    let runtime = FakeRuntime::new();
    let agent = agent(
        provider.clone(),
        registry(sandbox_manager(runtime.clone()), Vec::new()),
        AgentConfig::default(),
    );

    let mut history = History::new();
    let report = run(&agent, &mut history, "go").await.unwrap();

    assert_eq!(report.iterations, 3);
    let results = tool_results(&history);
    let error = results[0].error.as_ref().unwrap();
    assert_eq!(error.kind, ToolErrorKind::Argument);
    assert!(error.message.contains("code"));
    assert!(!results[1].is_error());
    // The rejected call never reached a sandbox
    assert_eq!(runtime.executes.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_negative_timeout_is_an_argument_error() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls(
                "",
                vec![ToolCall::new(
                    "neg",
                    RUN_CODE_TOOL,
                    json!({ "code": "x = 1", "timeout_secs": -3 }),
                )],
            ))
            .reply(AssistantReply::text("noted")),
    );
    let runtime = FakeRuntime::new();
    let agent = agent(
        provider,
        registry(sandbox_manager(runtime.clone()), Vec::new()),
        AgentConfig::default(),
    );

    let mut history = History::new();
    run(&agent, &mut history, "go").await.unwrap();

    let error = tool_results(&history)[0].error.clone().unwrap();
    assert_eq!(error.kind, ToolErrorKind::Argument);
    assert!(error.message.contains("at least 1"));
    assert_eq!(runtime.executes.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_execution_error_is_observed() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls("", vec![run_code("c1", "raise ZeroDivisionError")]))
            .reply(AssistantReply::text("that failed")),
    );
    let agent = agent(
        provider.clone(),
        registry(sandbox_manager(FakeRuntime::new()), Vec::new()),
        AgentConfig::default(),
    );

    let mut history = History::new();
    run(&agent, &mut history, "divide").await.unwrap();

    let result = tool_results(&history)[0];
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.kind, ToolErrorKind::Execution);
    assert!(result.output.contains("ZeroDivisionError"));

    // The model saw the failure on its second call
    let second = &provider.requests()[1];
    assert_eq!(second.messages.last().unwrap().role(), Role::Tool);
    assert_eq!(second.tool_names, vec![RUN_CODE_TOOL.to_string()]);
}

#[tokio::test]
async fn test_each_figure_becomes_its_own_artifact() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls(
                "",
                vec![run_code("c1", "figure(left)\nfigure(right)")],
            ))
            .reply(AssistantReply::text("two charts")),
    );
    let agent = agent(
        provider.clone(),
        registry(sandbox_manager(FakeRuntime::new()), Vec::new()),
        AgentConfig::default(),
    );

    let (tx, mut rx) = broadcast::channel(256);
    let mut history = History::new();
    agent
        .run_turn(
            "s1",
            &mut history,
            Message::user("plot"),
            &EventSink::new("s1", tx),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let result = tool_results(&history)[0];
    assert_eq!(result.artifacts.len(), 2);
    assert_eq!(result.artifacts[0].source, "left");
    assert_eq!(result.artifacts[1].source, "right");
    assert!(result.output.contains("[artifacts]"));

    let announced: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            TraceEvent::ArtifactAvailable { artifact, .. } => Some(artifact.source),
            _ => None,
        })
        .collect();
    assert_eq!(announced, vec!["left", "right"]);

    // Images travel back to the model with the tool result
    let second = &provider.requests()[1];
    let observed = second.messages.last().unwrap().tool_result().unwrap();
    assert!(observed.artifacts.iter().all(|a| a.image.is_some()));
}

#[tokio::test]
async fn test_event_stream_brackets_the_turn() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply {
                text: String::new(),
                tool_calls: vec![run_code("c1", "x = 1")],
                usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                }),
            })
            .reply(AssistantReply {
                text: "ok".into(),
                tool_calls: Vec::new(),
                usage: Some(TokenUsage {
                    prompt_tokens: 20,
                    completion_tokens: 2,
                }),
            }),
    );
    let agent = agent(
        provider,
        registry(sandbox_manager(FakeRuntime::new()), Vec::new()),
        AgentConfig::default(),
    );

    let (tx, mut rx) = broadcast::channel(256);
    let mut history = History::new();
    let report = agent
        .run_turn(
            "s1",
            &mut history,
            Message::user("go"),
            &EventSink::new("s1", tx),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.usage.total(), 37);

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(TraceEvent::TurnStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(TraceEvent::TurnFinished { outcome: "done", iterations: 2, .. })
    ));

    let states: Vec<LoopState> = events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            LoopState::Thinking,
            LoopState::Acting,
            LoopState::Observing,
            LoopState::Thinking,
            LoopState::Done,
        ]
    );

    let last_usage = events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::Usage { turn_total, .. } => Some(turn_total.total()),
            _ => None,
        })
        .last();
    assert_eq!(last_usage, Some(37));
}

#[tokio::test]
async fn test_sandbox_loss_fails_turn_and_keeps_history() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::text("hi"))
            .reply(AssistantReply::with_tool_calls("", vec![run_code("c1", "x = 1")])),
    );
    let runtime = FakeRuntime::new();
    let agent = agent(
        provider,
        registry(sandbox_manager(runtime.clone()), Vec::new()),
        AgentConfig::default(),
    );

    let mut history = History::new();
    run(&agent, &mut history, "hello").await.unwrap();
    let before = history.clone();

    runtime.crash_next_executes(2);
    let err = run(&agent, &mut history, "compute").await.unwrap_err();

    assert!(matches!(err, TurnError::SandboxUnavailable(_)));
    assert_eq!(history, before);
}

#[tokio::test]
async fn test_provider_exhaustion_after_bounded_retries() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .fail(ProviderError::Network("connection reset".into()))
            .fail(ProviderError::Network("connection reset".into()))
            .fail(ProviderError::Network("connection reset".into()))
            .reply(AssistantReply::text("too late")),
    );
    let tools = registry(sandbox_manager(FakeRuntime::new()), Vec::new());
    let agent = AgentLoop::new(provider.clone(), tools, AgentConfig::default()).with_retry(
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    );

    let mut history = History::new();
    let err = run(&agent, &mut history, "hi").await.unwrap_err();

    match err {
        TurnError::ProviderExhausted(exhausted) => assert_eq!(exhausted.attempts, 3),
        other => panic!("expected provider exhaustion, got {:?}", other),
    }
    assert_eq!(provider.calls(), 3);
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_transient_provider_error_is_retried() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .fail(ProviderError::RateLimited { retry_after: None })
            .reply(AssistantReply::text("recovered")),
    );
    let tools = registry(sandbox_manager(FakeRuntime::new()), Vec::new());
    let agent = AgentLoop::new(provider.clone(), tools, AgentConfig::default()).with_retry(
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    );

    let mut history = History::new();
    let report = run(&agent, &mut history, "hi").await.unwrap();
    assert_eq!(report.outcome.text(), "recovered");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_cancellation_discards_in_flight_turn() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(AssistantReply::with_tool_calls("", vec![run_code("c1", "sleep(2000)")]))
            .reply(AssistantReply::text("never")),
    );
    let agent = agent(
        provider,
        registry(sandbox_manager(FakeRuntime::new()), Vec::new()),
        AgentConfig::default(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut history = History::new();
    let started = std::time::Instant::now();
    let err = agent
        .run_turn(
            "s1",
            &mut history,
            Message::user("slow"),
            &EventSink::disabled("s1"),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TurnError::Cancelled));
    assert!(history.is_empty());
    assert!(started.elapsed() < Duration::from_millis(1000));
}

/// Full round trip against a local Ollama server
#[tokio::test]
#[ignore = "requires Ollama running with a tool-capable model and python3"]
async fn test_ollama_end_to_end() {
    use agentbox::capture::CaptureRegistry;
    use agentbox::llm::{OllamaConfig, OllamaProvider};
    use agentbox::sandbox::{ProcessRuntime, ProcessRuntimeConfig, SandboxManager};

    let sandboxes = Arc::new(SandboxManager::new(
        Arc::new(ProcessRuntime::new(ProcessRuntimeConfig::default())),
        Arc::new(CaptureRegistry::with_defaults()),
        Default::default(),
    ));
    let provider = Arc::new(OllamaProvider::new(OllamaConfig::default()).unwrap());
    let agent = AgentLoop::new(provider, registry(sandboxes.clone(), Vec::new()), AgentConfig::default());

    let mut history = History::new();
    let report = run(&agent, &mut history, "Use run_code to compute 17 * 23 and tell me the result.")
        .await
        .unwrap();
    assert!(report.outcome.text().contains("391"));
    sandboxes.shutdown().await;
}
