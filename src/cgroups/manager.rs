//! cgroup v2 limits for sandbox driver processes
//!
//! Each sandbox gets its own cgroup under /sys/fs/cgroup/agentbox/{sandbox_id}/
//!
//! ```text
//! /sys/fs/cgroup/                     ← cgroup v2 root
//! └── agentbox/                       ← our namespace
//!     ├── sbx-0192.../                ← per-sandbox cgroup
//!     │   ├── cpu.max                 ← "400000 100000" = 4 cores
//!     │   ├── memory.max              ← bytes
//!     │   └── cgroup.procs            ← driver PID (children follow)
//!     └── sbx-0193.../
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;

/// Base path for cgroup v2 filesystem
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Our namespace within the cgroup hierarchy
const CGROUP_NAMESPACE: &str = "agentbox";

/// CPU accounting period in microseconds (100ms)
const CPU_PERIOD_USEC: u64 = 100_000;

/// CPU and memory ceiling for one sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Number of CPU cores (fractional allowed)
    pub cpu_cores: f64,
    /// Memory limit in bytes
    pub memory_bytes: u64,
}

impl ResourceLimits {
    pub fn from_mib(cpu_cores: f64, memory_mib: u64) -> Self {
        Self {
            cpu_cores,
            memory_bytes: memory_mib * 1024 * 1024,
        }
    }

    /// `cpu.max` line: "{quota} {period}"
    pub fn cpu_max(&self) -> String {
        let quota = (self.cpu_cores * CPU_PERIOD_USEC as f64) as u64;
        format!("{} {}", quota.max(1000), CPU_PERIOD_USEC)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from_mib(4.0, 4096)
    }
}

/// Manages cgroup lifecycle for sandboxes
#[derive(Debug)]
pub struct CgroupManager {
    /// Base path: /sys/fs/cgroup/agentbox
    base_path: PathBuf,
}

impl CgroupManager {
    /// Create the namespace and enable the cpu and memory controllers for children
    ///
    /// Requires root privileges or a delegated subtree.
    pub fn new() -> io::Result<Self> {
        Self::with_base(PathBuf::from(CGROUP_ROOT).join(CGROUP_NAMESPACE))
    }

    fn with_base(base_path: PathBuf) -> io::Result<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }
        // Children may only use controllers enabled in the parent's subtree_control
        fs::write(base_path.join("cgroup.subtree_control"), "+cpu +memory")?;
        Ok(Self { base_path })
    }

    fn sandbox_path(&self, sandbox_id: &str) -> PathBuf {
        self.base_path.join(sandbox_id)
    }

    /// Create a cgroup for a sandbox and write its limits
    pub fn create(&self, sandbox_id: &str, limits: &ResourceLimits) -> io::Result<()> {
        let cgroup_path = self.sandbox_path(sandbox_id);
        fs::create_dir_all(&cgroup_path)?;
        fs::write(cgroup_path.join("cpu.max"), limits.cpu_max())?;
        fs::write(
            cgroup_path.join("memory.max"),
            limits.memory_bytes.to_string(),
        )?;
        Ok(())
    }

    /// Move a process (and its future children) into the sandbox's cgroup
    pub fn add_process(&self, sandbox_id: &str, pid: u32) -> io::Result<()> {
        fs::write(
            self.sandbox_path(sandbox_id).join("cgroup.procs"),
            pid.to_string(),
        )
    }

    /// Remove the cgroup; the kernel refuses while processes remain inside
    pub fn destroy(&self, sandbox_id: &str) -> io::Result<()> {
        let cgroup_path = self.sandbox_path(sandbox_id);
        if cgroup_path.exists() {
            fs::remove_dir(&cgroup_path)?;
        }
        Ok(())
    }

    pub fn exists(&self, sandbox_id: &str) -> bool {
        self.sandbox_path(sandbox_id).exists()
    }

    /// Current memory usage in bytes (memory.current)
    pub fn memory_usage(&self, sandbox_id: &str) -> io::Result<u64> {
        let content = fs::read_to_string(self.sandbox_path(sandbox_id).join("memory.current"))?;
        content
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_mib() {
        let limits = ResourceLimits::from_mib(2.0, 512);
        assert_eq!(limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(limits.cpu_max(), "200000 100000");
    }

    #[test]
    fn test_fractional_cpu_quota() {
        assert_eq!(ResourceLimits::from_mib(0.5, 1).cpu_max(), "50000 100000");
        // Quota never drops below 1ms per period
        assert_eq!(ResourceLimits::from_mib(0.0, 1).cpu_max(), "1000 100000");
    }

    #[test]
    fn test_create_and_destroy_in_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CgroupManager::with_base(dir.path().join("agentbox")).unwrap();

        manager.create("sbx-1", &ResourceLimits::default()).unwrap();
        assert!(manager.exists("sbx-1"));
        let cpu = std::fs::read_to_string(dir.path().join("agentbox/sbx-1/cpu.max")).unwrap();
        assert_eq!(cpu, "400000 100000");

        // Plain directories are not empty after writes, so rmdir fails like a busy cgroup
        assert!(manager.destroy("sbx-1").is_err());
        assert!(manager.destroy("missing").is_ok());
    }
}
