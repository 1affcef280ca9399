//! agentbox - LLM agent loop with stateful, sandboxed code execution
//!
//! An agent alternates between asking a model what to do and running the
//! code it asks for in a per-session sandbox whose namespace survives
//! between calls. Figures and images produced by that code are captured and
//! shown to both the user (trace events) and the model (vision input).
//!
//! # Modules
//!
//! - `agent` - think/act/observe loop, trace events, session registry
//! - `tools` - tool schemas, argument validation, dispatch, `run_code`
//! - `sandbox` - sandbox lifecycle, crash recovery, process-backed runtime
//! - `protocol` - JSON-lines execution protocol spoken by the guest driver
//! - `capture` - conversion of captured objects into artifacts
//! - `llm` - model provider interface, retries, Ollama adapter
//! - `conversation` - messages, tool calls and results
//! - `cgroups` - cgroup v2 resource limits for sandbox processes
//! - `config` - TOML configuration
//! - `metrics` - Prometheus metrics
//! - `tracing` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use agentbox::{AgentConfig, AgentLoop, SessionManager};
//!
//! let sandboxes = Arc::new(SandboxManager::new(runtime, capture, Default::default()));
//! let mut tools = ToolRegistry::new();
//! tools.register(Arc::new(RunCodeTool::new(sandboxes.clone(), Duration::from_secs(300))))?;
//! let agent = AgentLoop::new(provider, Arc::new(tools), AgentConfig::default());
//!
//! let sessions = SessionManager::new(Arc::new(agent), sandboxes);
//! let id = sessions.create().await;
//! let report = sessions.submit(&id, Message::user("plot sin(x)")).await?;
//! ```

pub mod agent;
pub mod capture;
pub mod cgroups;
pub mod config;
pub mod conversation;
pub mod llm;
pub mod metrics;
pub mod protocol;
pub mod sandbox;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentLoop, SessionManager, TraceEvent, TurnError, TurnOutcome};
pub use config::AppConfig;
pub use conversation::{History, Message};
pub use sandbox::{SandboxManager, SandboxRuntime};
pub use tools::{RunCodeTool, ToolRegistry};
