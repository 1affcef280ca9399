//! Tool registry and dispatcher
//!
//! ```text
//! ToolCall ──► lookup by name ──► validate args ──► Tool::invoke ──► ToolResult
//!                  │ unknown          │ invalid          │ Err(Failed)
//!                  ▼                  ▼                  ▼
//!            ToolResult(error)  ToolResult(error)  ToolResult(error)
//!
//!                                                     │ Err(Sandbox)
//!                                                     ▼
//!                                              DispatchError (turn fails)
//! ```
//!
//! Only a lost sandbox escapes as an error; everything else becomes an
//! observation the model can react to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use super::schema::ToolSchema;
use crate::capture::Artifact;
use crate::conversation::{ToolCall, ToolErrorInfo, ToolErrorKind, ToolResult};
use crate::metrics::TOOL_CALLS;
use crate::sandbox::SandboxError;

/// Per-call context handed to tool implementations
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Session whose sandbox the tool may use
    pub session_id: String,
    /// Cancelled when the turn is abandoned
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
        }
    }
}

/// What a tool produced
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub output: String,
    pub artifacts: Vec<Artifact>,
    /// Set when the work itself failed (e.g. the snippet raised)
    pub error: Option<ToolErrorInfo>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

/// Tool implementation failures
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Recoverable; reported to the model
    #[error("{0}")]
    Failed(String),
    /// The session's sandbox is gone; fails the turn
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Failure that ends the current turn
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("tool `{tool}` lost its sandbox: {source}")]
    SandboxUnavailable {
        tool: String,
        #[source]
        source: SandboxError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    Duplicate(String),
}

/// A capability the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Whether calls may run concurrently with other calls in the same step
    fn independent(&self) -> bool {
        false
    }

    /// Arguments have already been validated against `schema()`
    async fn invoke(&self, ctx: &ToolContext, arguments: Value) -> Result<ToolOutput, ToolError>;
}

struct Registered {
    schema: ToolSchema,
    tool: Arc<dyn Tool>,
}

/// Declared tools, in registration order
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Registered>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let schema = tool.schema();
        if self.by_name.contains_key(&schema.name) {
            return Err(RegistryError::Duplicate(schema.name));
        }
        self.by_name.insert(schema.name.clone(), self.tools.len());
        self.tools.push(Registered { schema, tool });
        Ok(())
    }

    /// Schemas advertised to the model on every THINKING call
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|r| r.schema.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| self.tools[i].tool.clone())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether a call may be dispatched concurrently; unknown tools are trivially independent
    pub fn is_independent(&self, name: &str) -> bool {
        self.by_name
            .get(name)
            .map(|&i| self.tools[i].tool.independent())
            .unwrap_or(true)
    }

    /// Validate and run one call, always producing exactly one result for it
    pub async fn dispatch(
        &self,
        ctx: &ToolContext,
        call: &ToolCall,
    ) -> Result<ToolResult, DispatchError> {
        let span = info_span!("tool_call", tool = %call.name, call_id = %call.id);
        self.dispatch_inner(ctx, call).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        ctx: &ToolContext,
        call: &ToolCall,
    ) -> Result<ToolResult, DispatchError> {
        let Some(&index) = self.by_name.get(&call.name) else {
            let available: Vec<&str> = self.tools.iter().map(|r| r.schema.name.as_str()).collect();
            return Ok(failed(
                call,
                ToolErrorInfo::new(
                    ToolErrorKind::UnknownTool,
                    format!(
                        "unknown tool `{}`; available tools: {}",
                        call.name,
                        available.join(", ")
                    ),
                ),
            ));
        };
        let registered = &self.tools[index];

        if let Err(e) = registered.schema.validate(&call.arguments) {
            debug!(error = %e, "Rejected tool arguments");
            return Ok(failed(
                call,
                ToolErrorInfo::new(ToolErrorKind::Argument, e.to_string()),
            ));
        }

        let arguments = match &call.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        match registered.tool.invoke(ctx, arguments).await {
            Ok(output) => {
                let status = output
                    .error
                    .as_ref()
                    .map(|e| e.kind.as_str())
                    .unwrap_or("ok");
                TOOL_CALLS.with_label_values(&[call.name.as_str(), status]).inc();
                Ok(ToolResult {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: output.output,
                    artifacts: output.artifacts,
                    error: output.error,
                })
            }
            Err(ToolError::Failed(message)) => Ok(failed(
                call,
                ToolErrorInfo::new(ToolErrorKind::Tool, message),
            )),
            Err(ToolError::Sandbox(source)) => {
                TOOL_CALLS.with_label_values(&[call.name.as_str(), "failed"]).inc();
                Err(DispatchError::SandboxUnavailable {
                    tool: call.name.clone(),
                    source,
                })
            }
        }
    }
}

fn failed(call: &ToolCall, error: ToolErrorInfo) -> ToolResult {
    TOOL_CALLS
        .with_label_values(&[call.name.as_str(), error.kind.as_str()])
        .inc();
    ToolResult::failure(call.id.clone(), call.name.clone(), error)
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.tools.iter().map(|r| r.schema.name.as_str()).collect();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
