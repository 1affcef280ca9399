//! Process runtime - each sandbox is a long-lived interpreter process
//!
//! The runtime spawns `guest/driver.py` once per sandbox and talks to it over
//! stdin/stdout (see [`crate::protocol`]). Each process gets its own working
//! directory and, when the host allows it, its own cgroup.
//!
//! ```text
//! ProcessRuntime
//! ├── sbx-0192.../  python3 -u -c <driver>   cwd = {work_root}/sbx-0192...
//! │                 cgroup /sys/fs/cgroup/agentbox/sbx-0192...
//! └── sbx-0193.../  python3 -u -c <driver>   cwd = {work_root}/sbx-0193...
//! ```
//!
//! An execution whose caller goes away (cancelled turn) is interrupted with
//! SIGINT; the next execution first waits for that snippet's response so the
//! two never overlap on the driver's stdout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::runtime::{RuntimeError, RuntimeHandle, SandboxRuntime, SandboxSpec};
use crate::cgroups::{CgroupManager, ResourceLimits};
use crate::protocol::{parse_line, DriverLine, ExecuteRequest, ExecuteResponse};

/// In-sandbox executor, run with `-c`
pub const DRIVER_SOURCE: &str = include_str!("../../guest/driver.py");

/// Configuration for the ProcessRuntime
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Interpreter binary (e.g., "python3")
    pub interpreter: String,
    /// Parent of the per-sandbox working directories
    pub work_root: PathBuf,
    /// cgroup limits per sandbox (None = no limits)
    pub limits: Option<ResourceLimits>,
    /// Extra environment for the driver
    pub env: Vec<(String, String)>,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            work_root: std::env::temp_dir().join("agentbox"),
            limits: Some(ResourceLimits::default()),
            env: Vec::new(),
        }
    }
}

/// A request the driver may still be working on
#[derive(Debug, Clone)]
struct Pending {
    command_id: String,
    deadline: Instant,
}

struct DriverProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    workdir: PathBuf,
    /// Set while a response is outstanding; survives a dropped `execute`
    pending: Option<Pending>,
}

impl DriverProcess {
    /// Wait out a snippet whose caller went away, within its own deadline
    async fn finish_abandoned(&mut self) -> Result<(), RuntimeError> {
        let Some(pending) = self.pending.clone() else {
            return Ok(());
        };
        debug!(command_id = %pending.command_id, "Waiting for an abandoned snippet to stop");
        self.read_response(&pending.command_id, pending.deadline)
            .await?;
        self.pending = None;
        Ok(())
    }

    /// Read until the driver answers `command_id`, skipping logs and stale responses
    async fn read_response(
        &mut self,
        command_id: &str,
        deadline: Instant,
    ) -> Result<ExecuteResponse, RuntimeError> {
        loop {
            let line = match tokio::time::timeout_at(deadline, self.stdout.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    return Err(RuntimeError::Unreachable("driver closed its output".into()))
                }
                Ok(Err(e)) => return Err(RuntimeError::Io(e)),
                Err(_) => {
                    let _ = self.child.start_kill();
                    return Err(RuntimeError::Unreachable(
                        "no response before the deadline".into(),
                    ));
                }
            };

            match parse_line(&line) {
                DriverLine::Response(response) if response.command_id == command_id => {
                    return Ok(response)
                }
                DriverLine::Response(response) => {
                    debug!(command_id = %response.command_id, "Discarding response for an abandoned request");
                }
                DriverLine::Ready | DriverLine::Other => {}
            }
        }
    }

    async fn wait_ready(&mut self) -> Result<(), RuntimeError> {
        while let Some(line) = self.stdout.next_line().await? {
            if parse_line(&line) == DriverLine::Ready {
                return Ok(());
            }
        }
        Err(RuntimeError::Spawn("driver exited before becoming ready".into()))
    }
}

/// Sends SIGINT to the driver if the execution future is dropped mid-flight
struct InterruptOnDrop {
    pid: Option<u32>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        let (true, Some(pid)) = (self.armed, self.pid) else {
            return;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) => debug!(pid, "Interrupted abandoned snippet"),
            Err(e) => debug!(pid, error = %e, "Failed to interrupt driver"),
        }
    }
}

/// Removes a half-provisioned sandbox's workdir and cgroup unless disarmed
struct ProvisionGuard<'a> {
    sandbox_id: String,
    workdir: PathBuf,
    cgroups: Option<&'a CgroupManager>,
    armed: bool,
}

impl<'a> ProvisionGuard<'a> {
    fn new(sandbox_id: &str, workdir: &Path, cgroups: Option<&'a CgroupManager>) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            workdir: workdir.to_path_buf(),
            cgroups,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProvisionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
            debug!(path = %self.workdir.display(), error = %e, "Failed to remove workdir");
        }
        if let Some(cgroups) = self.cgroups {
            if let Err(e) = cgroups.destroy(&self.sandbox_id) {
                warn!(sandbox_id = %self.sandbox_id, error = %e, "Failed to remove cgroup");
            }
        }
    }
}

/// Runs each sandbox as a separate interpreter process
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
    /// Cgroup manager for resource limits (None if cgroups unavailable)
    cgroups: Option<CgroupManager>,
    processes: Mutex<HashMap<String, Arc<Mutex<DriverProcess>>>>,
}

impl ProcessRuntime {
    /// Create a runtime; cgroups are optional and their absence only disables limits
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        let cgroups = match config.limits {
            Some(_) => match CgroupManager::new() {
                Ok(manager) => {
                    info!("Cgroup manager initialized");
                    Some(manager)
                }
                Err(e) => {
                    warn!(error = %e, "Cgroups unavailable, sandboxes will run without resource limits");
                    None
                }
            },
            None => None,
        };

        Self {
            config,
            cgroups,
            processes: Mutex::new(HashMap::new()),
        }
    }

    async fn process(&self, handle: &RuntimeHandle) -> Result<Arc<Mutex<DriverProcess>>, RuntimeError> {
        self.processes
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(handle.id.clone()))
    }

    fn apply_limits(&self, sandbox_id: &str, pid: Option<u32>) {
        let (Some(cgroups), Some(limits), Some(pid)) = (&self.cgroups, &self.config.limits, pid)
        else {
            return;
        };
        let result = cgroups
            .create(sandbox_id, limits)
            .and_then(|_| cgroups.add_process(sandbox_id, pid));
        if let Err(e) = result {
            warn!(sandbox_id, error = %e, "Failed to apply cgroup limits");
        }
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeHandle, RuntimeError> {
        let workdir = self.config.work_root.join(&spec.sandbox_id);
        tokio::fs::create_dir_all(&workdir).await?;
        let cleanup = ProvisionGuard::new(&spec.sandbox_id, &workdir, self.cgroups.as_ref());

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .current_dir(&workdir)
            .env("MPLBACKEND", "Agg")
            .env("AGENTBOX_CAPTURE_TAGS", spec.capture_tags.join(","))
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            RuntimeError::Spawn(format!("{}: {}", self.config.interpreter, e))
        })?;
        self.apply_limits(&spec.sandbox_id, child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Spawn("driver stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Spawn("driver stdout not captured".into()))?;

        let mut process = DriverProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            workdir,
            pending: None,
        };
        if let Err(e) = process.wait_ready().await {
            // Reap first so the cgroup is empty when the guard removes it
            let _ = process.child.start_kill();
            let _ = process.child.wait().await;
            return Err(e);
        }
        debug!(sandbox_id = %spec.sandbox_id, pid = ?process.child.id(), "Driver ready");

        let handle = RuntimeHandle::new(spec.sandbox_id.clone());
        self.processes
            .lock()
            .await
            .insert(handle.id.clone(), Arc::new(Mutex::new(process)));
        cleanup.disarm();
        Ok(handle)
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let Some(process) = self.processes.lock().await.remove(&handle.id) else {
            return Ok(());
        };

        let mut process = process.lock().await;
        if let Err(e) = process.child.start_kill() {
            // Process might already be dead
            debug!(sandbox_id = %handle.id, error = %e, "Kill failed");
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), process.child.wait()).await;

        if let Err(e) = tokio::fs::remove_dir_all(&process.workdir).await {
            debug!(path = %process.workdir.display(), error = %e, "Failed to remove workdir");
        }
        if let Some(cgroups) = &self.cgroups {
            if let Err(e) = cgroups.destroy(&handle.id) {
                warn!(sandbox_id = %handle.id, error = %e, "Failed to remove cgroup");
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        handle: &RuntimeHandle,
        request: ExecuteRequest,
        deadline: Duration,
    ) -> Result<ExecuteResponse, RuntimeError> {
        let process = self.process(handle).await?;
        let mut process = process.lock().await;
        process.finish_abandoned().await?;

        let line = request
            .to_line()
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        let write = async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.flush().await
        };
        if let Err(e) = write.await {
            return Err(RuntimeError::Unreachable(format!("driver stdin: {}", e)));
        }

        let deadline = Instant::now() + deadline;
        process.pending = Some(Pending {
            command_id: request.command_id.clone(),
            deadline,
        });
        let mut interrupt = InterruptOnDrop {
            pid: process.child.id(),
            armed: true,
        };
        let response = process.read_response(&request.command_id, deadline).await;
        interrupt.armed = false;
        process.pending = None;
        response
    }

    async fn is_alive(&self, handle: &RuntimeHandle) -> bool {
        let Ok(process) = self.process(handle).await else {
            return false;
        };
        // Busy executing; `execute` notices a dead driver on its own
        let Ok(mut process) = process.try_lock() else {
            return true;
        };
        matches!(process.child.try_wait(), Ok(None))
    }
}

impl std::fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRuntime")
            .field("config", &self.config)
            .field("cgroups", &self.cgroups.is_some())
            .finish()
    }
}
