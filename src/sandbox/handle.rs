//! Sandbox - one isolated execution environment bound to one session
//!
//! Status transitions:
//!
//! ```text
//! Starting ──► Ready ◄──► Executing
//!                │            │
//!                ▼            ▼
//!           Terminated     Crashed ──► Terminated
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::runtime::RuntimeHandle;

/// Status of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    /// Runtime is being provisioned
    Starting,
    /// Idle, ready to run a snippet
    Ready,
    /// A snippet is in flight
    Executing,
    /// Runtime stopped answering; must be replaced
    Crashed,
    /// Torn down
    Terminated,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Starting => "starting",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Executing => "executing",
            SandboxStatus::Crashed => "crashed",
            SandboxStatus::Terminated => "terminated",
        }
    }

    /// Whether the sandbox can still serve executions
    pub fn is_usable(&self) -> bool {
        matches!(self, SandboxStatus::Ready | SandboxStatus::Executing)
    }
}

/// A provisioned sandbox owned by exactly one session
pub struct Sandbox {
    /// Unique identifier (e.g., "sbx-01926abc...")
    pub sandbox_id: String,
    /// Owning session
    pub session_id: String,
    /// Runtime-side reference
    pub handle: RuntimeHandle,
    status: Mutex<SandboxStatus>,
    /// Held for the duration of one execution; at most one snippet in flight
    pub(crate) exec_lock: tokio::sync::Mutex<()>,
    /// When this sandbox was created
    pub created_at: Instant,
    last_used: Mutex<Instant>,
}

impl Sandbox {
    pub fn new(sandbox_id: String, session_id: String, handle: RuntimeHandle) -> Self {
        let now = Instant::now();
        Self {
            sandbox_id,
            session_id,
            handle,
            status: Mutex::new(SandboxStatus::Starting),
            exec_lock: tokio::sync::Mutex::new(()),
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    pub fn status(&self) -> SandboxStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_status(&self, status: SandboxStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn is_usable(&self) -> bool {
        self.status().is_usable()
    }

    /// Record activity for idle eviction
    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last execution finished (or creation)
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("sandbox_id", &self.sandbox_id)
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .field("age", &self.age())
            .finish()
    }
}
