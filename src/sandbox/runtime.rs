//! Sandbox runtime interface
//!
//! The lifecycle manager treats the isolation technology as opaque. Anything
//! that can create an environment, run a snippet in it, and destroy it again
//! plugs in here: the bundled [`ProcessRuntime`](super::ProcessRuntime), a
//! microVM, a container, or an in-memory fake in tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::{ExecuteRequest, ExecuteResponse};

/// Opaque reference to one isolated runtime instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeHandle {
    pub id: String,
}

impl RuntimeHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// What the runtime needs to know to provision a sandbox
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    /// Identifier the lifecycle manager assigned to the sandbox
    pub sandbox_id: String,
    /// Visual type tags the in-sandbox driver should scan for after each snippet
    pub capture_tags: Vec<String>,
}

/// Failures of the runtime itself (not of the code it runs)
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to start sandbox: {0}")]
    Spawn(String),
    /// The runtime stopped answering; the sandbox is considered crashed
    #[error("sandbox unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Isolation backend: `create`, `destroy`, `execute`, plus a liveness probe
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Provision a fresh environment with an empty namespace
    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeHandle, RuntimeError>;

    /// Tear the environment down; destroying an unknown handle is not an error
    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError>;

    /// Run one snippet against the persistent namespace
    ///
    /// `deadline` bounds the whole round trip. Snippet timeouts inside the
    /// budget come back as a response with a timeout error; only a runtime
    /// that cannot answer at all returns [`RuntimeError::Unreachable`].
    async fn execute(
        &self,
        handle: &RuntimeHandle,
        request: ExecuteRequest,
        deadline: Duration,
    ) -> Result<ExecuteResponse, RuntimeError>;

    /// Cheap liveness probe, used before an idle sandbox is reused
    async fn is_alive(&self, handle: &RuntimeHandle) -> bool;
}
