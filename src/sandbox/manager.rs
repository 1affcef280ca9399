//! Sandbox Manager - one sandbox per session, provisioned lazily
//!
//! The SandboxManager is responsible for:
//! - Provisioning a sandbox the first time a session needs one (cold start)
//! - Handing the same sandbox back on every later `acquire` for that session,
//!   after checking that an idle one is still alive
//! - Serializing executions so a namespace never has two writers
//! - Replacing a crashed sandbox once, then giving up with `Unavailable`
//! - Evicting sandboxes that sat idle or lived too long
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SandboxManager                                                  │
//! │                                                                  │
//! │  slots: session_id ──► Mutex<Option<Arc<Sandbox>>>               │
//! │                                                                  │
//! │  "s1" ──► [ sbx-0192.. Ready ]     "s2" ──► [ sbx-0193.. Exec ]  │
//! │                                                                  │
//! │  execute("s1", code)                                             │
//! │     ├── acquire("s1")          (provision if empty/crashed/dead) │
//! │     ├── sandbox.exec_lock      (one snippet in flight)           │
//! │     ├── runtime.execute()                                        │
//! │     │      └── Unreachable ──► mark Crashed, destroy, retry once │
//! │     └── capture registry ──► artifacts                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The slot mutex is held while provisioning, so concurrent `acquire` calls
//! for one session share a single cold start. The slot map lock itself is
//! only held long enough to look a slot up, so sessions never wait on each
//! other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::handle::{Sandbox, SandboxStatus};
use super::runtime::{RuntimeError, SandboxRuntime, SandboxSpec};
use crate::capture::{Artifact, CaptureRegistry};
use crate::metrics::{
    CODE_EXECUTIONS, CODE_EXECUTION_DURATION, SANDBOXES_ACTIVE, SANDBOX_PROVISION_DURATION,
    SANDBOX_RECOVERIES,
};
use crate::protocol::{ExecuteRequest, ExecuteResponse};

/// Attempts per execution or provisioning: the original plus one recovery
const MAX_ATTEMPTS: u32 = 2;

/// Configuration for the SandboxManager
#[derive(Debug, Clone)]
pub struct SandboxManagerConfig {
    /// Upper bound on a cold start
    pub create_timeout: Duration,
    /// Extra time on top of a snippet's budget before the runtime counts as unreachable
    pub exec_grace: Duration,
    /// Tear down sandboxes unused for this long (None = never)
    pub idle_timeout: Option<Duration>,
    /// Tear down sandboxes older than this (None = never)
    pub max_lifetime: Option<Duration>,
    /// Snippet run once right after provisioning
    pub init_script: Option<String>,
}

impl Default for SandboxManagerConfig {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(30),
            exec_grace: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(1800)),
            max_lifetime: Some(Duration::from_secs(7200)),
            init_script: None,
        }
    }
}

/// Lifecycle failures surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Provisioning or crash recovery exhausted
    #[error("sandbox unavailable for session {session_id}: {source}")]
    Unavailable {
        session_id: String,
        #[source]
        source: RuntimeError,
    },
    /// The sandbox was released while an execution was in flight
    #[error("sandbox for session {0} was released")]
    Released(String),
    #[error("sandbox manager is shut down")]
    ShutDown,
}

/// Output of one execution, with artifacts already captured
#[derive(Debug, Clone)]
pub struct Execution {
    pub sandbox_id: String,
    pub response: ExecuteResponse,
    pub artifacts: Vec<Artifact>,
    /// Capture candidates that could not be serialized
    pub skipped_captures: Vec<String>,
    /// The previous sandbox crashed and this result came from a fresh one
    pub recovered: bool,
}

type Slot = Arc<Mutex<Option<Arc<Sandbox>>>>;

enum ExecFailure {
    /// Sandbox was no longer usable once the execution lock was obtained
    Stale,
    Runtime(RuntimeError),
}

/// Resets `Executing` to `Ready` when an execution future finishes or is dropped
struct ExecutingGuard<'a>(&'a Sandbox);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        if self.0.status() == SandboxStatus::Executing {
            self.0.set_status(SandboxStatus::Ready);
        }
        self.0.touch();
    }
}

/// Owns every session's sandbox
pub struct SandboxManager {
    runtime: Arc<dyn SandboxRuntime>,
    capture: Arc<CaptureRegistry>,
    config: SandboxManagerConfig,
    slots: Mutex<HashMap<String, Slot>>,
    shut_down: AtomicBool,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        capture: Arc<CaptureRegistry>,
        config: SandboxManagerConfig,
    ) -> Self {
        Self {
            runtime,
            capture,
            config,
            slots: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SandboxManagerConfig {
        &self.config
    }

    async fn slot(&self, session_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return the session's ready sandbox, provisioning one if needed
    ///
    /// Idempotent: a live ready sandbox is returned as-is. A crashed or
    /// terminated one, or an idle one whose runtime died, is destroyed and
    /// replaced (its namespace is gone).
    pub async fn acquire(&self, session_id: &str) -> Result<Arc<Sandbox>, SandboxError> {
        self.acquire_checked(session_id).await.map(|(sandbox, _)| sandbox)
    }

    /// Like `acquire`, also reporting whether a dead idle sandbox was replaced
    async fn acquire_checked(
        &self,
        session_id: &str,
    ) -> Result<(Arc<Sandbox>, bool), SandboxError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SandboxError::ShutDown);
        }

        let slot = self.slot(session_id).await;
        let mut current = slot.lock().await;

        let mut died_idle = false;
        if let Some(existing) = current.as_ref() {
            // An executing sandbox is checked by the execution itself
            let alive = existing.status() != SandboxStatus::Ready
                || self.runtime.is_alive(&existing.handle).await;
            if existing.is_usable() && alive {
                return Ok((existing.clone(), false));
            }
            if existing.is_usable() {
                warn!(session_id, sandbox_id = %existing.sandbox_id, "Idle sandbox died");
                existing.set_status(SandboxStatus::Crashed);
                died_idle = true;
            }
        }
        if let Some(stale) = current.take() {
            debug!(sandbox_id = %stale.sandbox_id, status = stale.status().as_str(), "Replacing stale sandbox");
            self.teardown(&stale).await;
        }

        let sandbox = self.provision(session_id).await?;
        *current = Some(sandbox.clone());
        if died_idle {
            SANDBOX_RECOVERIES.inc();
        }
        Ok((sandbox, died_idle))
    }

    /// Provision with one transparent retry
    async fn provision(&self, session_id: &str) -> Result<Arc<Sandbox>, SandboxError> {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.provision_once(session_id).await {
                Ok(sandbox) => return Ok(sandbox),
                Err(e) => {
                    warn!(session_id, attempt, error = %e, "Sandbox provisioning failed");
                    last_error = Some(e);
                }
            }
        }
        Err(SandboxError::Unavailable {
            session_id: session_id.to_string(),
            source: last_error
                .unwrap_or_else(|| RuntimeError::Spawn("no provisioning attempt made".into())),
        })
    }

    async fn provision_once(&self, session_id: &str) -> Result<Arc<Sandbox>, RuntimeError> {
        let sandbox_id = format!("sbx-{}", Uuid::now_v7());
        let span = info_span!("sandbox_provision", session_id, sandbox_id = %sandbox_id, runtime = self.runtime.name());

        async {
            let start = Instant::now();
            let spec = SandboxSpec {
                sandbox_id: sandbox_id.clone(),
                capture_tags: self.capture.recognized_tags(),
            };

            let handle = match tokio::time::timeout(
                self.config.create_timeout,
                self.runtime.create(&spec),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(RuntimeError::Spawn(format!(
                        "creation timed out after {:?}",
                        self.config.create_timeout
                    )))
                }
            };

            let sandbox = Arc::new(Sandbox::new(
                sandbox_id.clone(),
                session_id.to_string(),
                handle,
            ));
            sandbox.set_status(SandboxStatus::Ready);
            SANDBOXES_ACTIVE.inc();
            SANDBOX_PROVISION_DURATION.observe(start.elapsed().as_secs_f64());
            info!(
                "Sandbox ready (took {:.3}ms)",
                start.elapsed().as_secs_f64() * 1000.0
            );

            if let Some(script) = self.config.init_script.as_deref() {
                self.run_init_script(&sandbox, script).await;
            }

            Ok(sandbox)
        }
        .instrument(span)
        .await
    }

    /// Failures are logged; the sandbox stays usable unless the runtime died
    async fn run_init_script(&self, sandbox: &Sandbox, script: &str) {
        let budget = self.config.create_timeout;
        let request = ExecuteRequest::new(script, Some(budget.as_millis() as u64));
        match self
            .runtime
            .execute(&sandbox.handle, request, budget + self.config.exec_grace)
            .await
        {
            Ok(response) => {
                if let Some(error) = response.error {
                    warn!(sandbox_id = %sandbox.sandbox_id, error = %error.summary(), "Init script raised");
                } else {
                    debug!(sandbox_id = %sandbox.sandbox_id, "Init script completed");
                }
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.sandbox_id, error = %e, "Init script failed");
                if matches!(e, RuntimeError::Unreachable(_)) {
                    sandbox.set_status(SandboxStatus::Crashed);
                }
            }
        }
    }

    /// Run a snippet in the session's sandbox
    ///
    /// If the runtime is unreachable the sandbox is marked crashed, a fresh
    /// one is provisioned and the snippet is retried once against the empty
    /// namespace. A second failure returns [`SandboxError::Unavailable`].
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<Execution, SandboxError> {
        let mut last_error = None;
        let mut recovered = false;
        let mut attempt = 0;
        let mut stale_rounds = 0;

        while attempt < MAX_ATTEMPTS {
            let (sandbox, replaced) = self.acquire_checked(session_id).await?;
            recovered |= replaced;
            let span = info_span!("code_execution", session_id, sandbox_id = %sandbox.sandbox_id, attempt = attempt + 1);

            let result = self
                .execute_on(&sandbox, code, timeout)
                .instrument(span)
                .await;

            match result {
                Ok(mut response) => {
                    let candidates = std::mem::take(&mut response.captures);
                    let report = self.capture.capture(candidates);
                    return Ok(Execution {
                        sandbox_id: sandbox.sandbox_id.clone(),
                        response,
                        artifacts: report.artifacts,
                        skipped_captures: report.skipped,
                        recovered,
                    });
                }
                // Replaced or evicted while we waited for the lock; nothing ran
                Err(ExecFailure::Stale) if stale_rounds < MAX_ATTEMPTS => {
                    stale_rounds += 1;
                }
                Err(ExecFailure::Stale) => {
                    return Err(SandboxError::Released(session_id.to_string()));
                }
                Err(ExecFailure::Runtime(e)) => {
                    attempt += 1;
                    if sandbox.status() == SandboxStatus::Terminated {
                        return Err(SandboxError::Released(session_id.to_string()));
                    }
                    warn!(session_id, sandbox_id = %sandbox.sandbox_id, attempt, error = %e, "Sandbox crashed during execution");
                    CODE_EXECUTIONS.with_label_values(&["crashed"]).inc();
                    sandbox.set_status(SandboxStatus::Crashed);
                    self.discard(session_id, &sandbox).await;
                    if attempt < MAX_ATTEMPTS {
                        SANDBOX_RECOVERIES.inc();
                        recovered = true;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(SandboxError::Unavailable {
            session_id: session_id.to_string(),
            source: last_error
                .unwrap_or_else(|| RuntimeError::Unreachable("no execution attempt made".into())),
        })
    }

    async fn execute_on(
        &self,
        sandbox: &Sandbox,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecuteResponse, ExecFailure> {
        let _exclusive = sandbox.exec_lock.lock().await;
        if !sandbox.is_usable() {
            return Err(ExecFailure::Stale);
        }

        sandbox.set_status(SandboxStatus::Executing);
        let _guard = ExecutingGuard(sandbox);
        let start = Instant::now();

        let request = ExecuteRequest::new(code, Some(timeout.as_millis() as u64));
        let response = self
            .runtime
            .execute(&sandbox.handle, request, timeout + self.config.exec_grace)
            .await
            .map_err(ExecFailure::Runtime)?;

        let status = match &response.error {
            None => "success",
            Some(e) if e.is_timeout() => "timeout",
            Some(_) => "error",
        };
        CODE_EXECUTIONS.with_label_values(&[status]).inc();
        CODE_EXECUTION_DURATION.observe(start.elapsed().as_secs_f64());
        debug!(status, captures = response.captures.len(), "Execution finished");

        Ok(response)
    }

    /// Drop a crashed sandbox from its slot unless it was already replaced
    async fn discard(&self, session_id: &str, sandbox: &Arc<Sandbox>) {
        let slot = self.slot(session_id).await;
        let mut current = slot.lock().await;
        if current
            .as_ref()
            .map(|s| Arc::ptr_eq(s, sandbox))
            .unwrap_or(false)
        {
            current.take();
        }
        drop(current);
        self.teardown(sandbox).await;
    }

    /// Tear down the session's sandbox; a no-op when there is none
    pub async fn release(&self, session_id: &str) {
        let slot = self.slots.lock().await.remove(session_id);
        let Some(slot) = slot else {
            return;
        };
        let sandbox = slot.lock().await.take();
        if let Some(sandbox) = sandbox {
            self.teardown(&sandbox).await;
            info!(session_id, sandbox_id = %sandbox.sandbox_id, "Sandbox released");
        }
    }

    async fn teardown(&self, sandbox: &Sandbox) {
        if sandbox.status() == SandboxStatus::Terminated {
            return;
        }
        sandbox.set_status(SandboxStatus::Terminated);
        SANDBOXES_ACTIVE.dec();
        if let Err(e) = self.runtime.destroy(&sandbox.handle).await {
            warn!(sandbox_id = %sandbox.sandbox_id, error = %e, "Failed to destroy sandbox");
        }
    }

    /// Current sandbox of a session, if one is bound
    pub async fn get(&self, session_id: &str) -> Option<Arc<Sandbox>> {
        let slot = self.slots.lock().await.get(session_id).cloned()?;
        let current = slot.lock().await;
        current.clone()
    }

    pub async fn status(&self, session_id: &str) -> Option<SandboxStatus> {
        self.get(session_id).await.map(|s| s.status())
    }

    /// Number of sessions with a bound sandbox
    pub async fn active_count(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Tear down sandboxes past their idle timeout or max lifetime
    ///
    /// Busy sandboxes are skipped. Returns how many were evicted; the next
    /// `acquire` for those sessions provisions a fresh sandbox.
    pub async fn evict_expired(&self) -> usize {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut evicted = 0;
        for (session_id, slot) in slots {
            let Ok(mut current) = slot.try_lock() else {
                continue;
            };
            let Some(sandbox) = current.as_ref().cloned() else {
                continue;
            };
            let Ok(_idle_lock) = sandbox.exec_lock.try_lock() else {
                continue;
            };

            let idle = self
                .config
                .idle_timeout
                .map(|limit| sandbox.idle_for() >= limit)
                .unwrap_or(false);
            let expired = self
                .config
                .max_lifetime
                .map(|limit| sandbox.age() >= limit)
                .unwrap_or(false);

            if idle || expired {
                current.take();
                info!(
                    session_id = %session_id,
                    sandbox_id = %sandbox.sandbox_id,
                    reason = if expired { "max_lifetime" } else { "idle" },
                    "Evicting sandbox"
                );
                self.teardown(&sandbox).await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Destroy every sandbox and refuse further acquisitions
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let slots: Vec<Slot> = self.slots.lock().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            let sandbox = slot.lock().await.take();
            if let Some(sandbox) = sandbox {
                self.teardown(&sandbox).await;
            }
        }
        info!("Sandbox manager shut down");
    }

    /// Start the background eviction task
    pub fn start_reaper(manager: Arc<SandboxManager>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                if manager.shut_down.load(Ordering::SeqCst) {
                    break;
                }
                let evicted = manager.evict_expired().await;
                if evicted > 0 {
                    debug!(evicted, "Reaper evicted sandboxes");
                }
            }
        })
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("runtime", &self.runtime.name())
            .field("config", &self.config)
            .finish()
    }
}
