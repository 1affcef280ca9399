//! Shared fakes for integration tests
//!
//! `FakeRuntime` is an in-memory sandbox backend with a tiny persistent
//! language, one statement per line (or separated by `;`):
//!
//! - `x = value`      bind a string
//! - `print(x)`       print a binding (NameError when unbound)
//! - `figure(label)`  leave a matplotlib-style figure behind
//! - `raise Kind`     raise an exception of type `Kind`
//! - `sleep(ms)`      sleep; exceeding the budget reports a timeout
//! - `crash()`        the runtime dies and stops answering
//! - `hang()`         never answer (the caller's deadline fires)

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentbox::agent::{AgentConfig, AgentLoop, SessionManager};
use agentbox::capture::CaptureRegistry;
use agentbox::llm::{RetryPolicy, ScriptedProvider};
use agentbox::protocol::{
    CaptureCandidate, ExceptionInfo, ExceptionKind, ExecuteRequest, ExecuteResponse,
};
use agentbox::sandbox::{
    RuntimeError, RuntimeHandle, SandboxManager, SandboxManagerConfig, SandboxRuntime, SandboxSpec,
};
use agentbox::tools::{ParamType, RunCodeTool, Tool, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolSchema};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

#[derive(Default)]
struct Namespace {
    vars: HashMap<String, String>,
    alive: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    sandboxes: Mutex<HashMap<String, Namespace>>,
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
    pub destroys: AtomicUsize,
    pub executes: AtomicUsize,
    /// Upcoming `create` calls that fail
    fail_creates: AtomicUsize,
    /// Upcoming `execute` calls that fail as unreachable
    crash_executes: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn crash_next_executes(&self, n: usize) {
        self.crash_executes.store(n, Ordering::SeqCst);
    }

    /// Every live sandbox dies without a request in flight (e.g. OOM-killed)
    pub fn kill_all(&self) {
        for namespace in self.sandboxes.lock().unwrap().values_mut() {
            namespace.alive = false;
        }
    }

    /// Sandboxes created and not yet destroyed
    pub fn live(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn with_namespace<T>(
        &self,
        handle: &RuntimeHandle,
        f: impl FnOnce(&mut Namespace) -> T,
    ) -> Result<T, RuntimeError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let namespace = sandboxes
            .get_mut(&handle.id)
            .ok_or_else(|| RuntimeError::NotFound(handle.id.clone()))?;
        if !namespace.alive {
            return Err(RuntimeError::Unreachable("driver exited".into()));
        }
        Ok(f(namespace))
    }

    async fn run(
        &self,
        handle: &RuntimeHandle,
        request: &ExecuteRequest,
    ) -> Result<ExecuteResponse, RuntimeError> {
        let mut response = ExecuteResponse {
            command_id: request.command_id.clone(),
            ..Default::default()
        };
        let budget = Duration::from_millis(request.timeout_ms.unwrap_or(300_000));
        let mut slept = Duration::ZERO;

        let statements = request
            .code
            .split(|c| c == '\n' || c == ';')
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for statement in statements {
            if statement == "crash()" {
                self.with_namespace(handle, |ns| ns.alive = false)?;
                return Err(RuntimeError::Unreachable("driver exited".into()));
            }
            if statement == "hang()" {
                std::future::pending::<()>().await;
            }
            if let Some(ms) = call_arg(statement, "sleep") {
                let wanted = Duration::from_millis(ms.parse().unwrap_or(0));
                let remaining = budget.saturating_sub(slept);
                if wanted > remaining {
                    tokio::time::sleep(remaining).await;
                    response.error = Some(ExceptionInfo {
                        kind: ExceptionKind::Timeout,
                        type_name: "TimeoutError".into(),
                        message: format!("execution exceeded {:?}", budget),
                        traceback: None,
                    });
                    break;
                }
                tokio::time::sleep(wanted).await;
                slept += wanted;
                continue;
            }
            if let Some(name) = call_arg(statement, "print") {
                let value = self.with_namespace(handle, |ns| ns.vars.get(name).cloned())?;
                match value {
                    Some(value) => {
                        response.stdout.push_str(&value);
                        response.stdout.push('\n');
                    }
                    None => {
                        response.error = Some(exception(
                            "NameError",
                            &format!("name '{}' is not defined", name),
                        ));
                        break;
                    }
                }
                continue;
            }
            if let Some(label) = call_arg(statement, "figure") {
                response.captures.push(CaptureCandidate {
                    type_tag: "matplotlib.figure".into(),
                    source: label.to_string(),
                    sequence: response.captures.len() as u32,
                    png_b64: Some(png_b64(label)),
                    ..Default::default()
                });
                continue;
            }
            if let Some(kind) = statement.strip_prefix("raise ") {
                response.error = Some(exception(kind.trim(), "raised by snippet"));
                break;
            }
            if let Some((name, value)) = statement.split_once('=') {
                let (name, value) = (name.trim().to_string(), value.trim().to_string());
                self.with_namespace(handle, |ns| ns.vars.insert(name, value))?;
                continue;
            }
            response.error = Some(exception("SyntaxError", statement));
            break;
        }
        Ok(response)
    }
}

fn call_arg<'a>(statement: &'a str, function: &str) -> Option<&'a str> {
    statement
        .strip_prefix(function)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn exception(type_name: &str, message: &str) -> ExceptionInfo {
    ExceptionInfo {
        kind: ExceptionKind::Exception,
        type_name: type_name.to_string(),
        message: message.to_string(),
        traceback: Some(format!(
            "Traceback (most recent call last):\n  File \"<snippet>\", line 1\n{}: {}",
            type_name, message
        )),
    }
}

/// PNG magic followed by the label, enough for the capture registry
pub fn png_b64(label: &str) -> String {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(label.as_bytes());
    STANDARD.encode(bytes)
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, _spec: &SandboxSpec) -> Result<RuntimeHandle, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.fail_creates) {
            return Err(RuntimeError::Spawn("injected create failure".into()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sandboxes.lock().unwrap().insert(
            id.clone(),
            Namespace {
                alive: true,
                ..Default::default()
            },
        );
        Ok(RuntimeHandle::new(id))
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        if self.sandboxes.lock().unwrap().remove(&handle.id).is_some() {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn execute(
        &self,
        handle: &RuntimeHandle,
        request: ExecuteRequest,
        deadline: Duration,
    ) -> Result<ExecuteResponse, RuntimeError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.crash_executes) {
            self.with_namespace(handle, |ns| ns.alive = false)?;
            return Err(RuntimeError::Unreachable("injected crash".into()));
        }
        match tokio::time::timeout(deadline, self.run(handle, &request)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Unreachable(format!(
                "no response within {:?}",
                deadline
            ))),
        }
    }

    async fn is_alive(&self, handle: &RuntimeHandle) -> bool {
        self.with_namespace(handle, |_| ()).is_ok()
    }
}

pub fn sandbox_manager(runtime: Arc<FakeRuntime>) -> Arc<SandboxManager> {
    sandbox_manager_with(runtime, SandboxManagerConfig::default())
}

pub fn sandbox_manager_with(
    runtime: Arc<FakeRuntime>,
    config: SandboxManagerConfig,
) -> Arc<SandboxManager> {
    Arc::new(SandboxManager::new(
        runtime,
        Arc::new(CaptureRegistry::with_defaults()),
        SandboxManagerConfig {
            exec_grace: Duration::from_millis(200),
            ..config
        },
    ))
}

/// Independent tool that sleeps, then echoes its label and records completion order
pub struct SleepTool {
    pub finished: Arc<Mutex<Vec<String>>>,
}

impl SleepTool {
    pub const NAME: &'static str = "sleep_echo";

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            finished: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(Self::NAME, "Sleep, then echo the label")
            .required("label", ParamType::String, "Text to echo")
            .required("ms", ParamType::Integer, "Milliseconds to sleep")
    }

    fn independent(&self) -> bool {
        true
    }

    async fn invoke(&self, _ctx: &ToolContext, arguments: Value) -> Result<ToolOutput, ToolError> {
        let label = arguments["label"].as_str().unwrap_or_default().to_string();
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.finished.lock().unwrap().push(label.clone());
        Ok(ToolOutput::text(label))
    }
}

/// Registry with `run_code` bound to `sandboxes`, plus extra tools
pub fn registry(sandboxes: Arc<SandboxManager>, extra: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut tools = ToolRegistry::new();
    tools
        .register(Arc::new(RunCodeTool::new(sandboxes, Duration::from_secs(5))))
        .unwrap();
    for tool in extra {
        tools.register(tool).unwrap();
    }
    Arc::new(tools)
}

pub fn agent(provider: Arc<ScriptedProvider>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Arc<AgentLoop> {
    Arc::new(AgentLoop::new(provider, tools, config).with_retry(RetryPolicy::none()))
}

/// Session manager over a fake runtime and a scripted model
pub fn sessions(
    provider: Arc<ScriptedProvider>,
    runtime: Arc<FakeRuntime>,
) -> (Arc<SessionManager>, Arc<SandboxManager>) {
    let sandboxes = sandbox_manager(runtime);
    let tools = registry(sandboxes.clone(), Vec::new());
    let agent = agent(provider, tools, AgentConfig::default());
    (
        Arc::new(SessionManager::new(agent, sandboxes.clone())),
        sandboxes,
    )
}
