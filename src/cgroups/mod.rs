//! cgroups v2 resource isolation for sandbox processes
//!
//! Each process-backed sandbox gets its own cgroup so one runaway snippet
//! cannot starve other sessions of CPU or memory.
//!
//! # Example Usage
//!
//! ```ignore
//! use agentbox::cgroups::{CgroupManager, ResourceLimits};
//!
//! let cgroups = CgroupManager::new()?;
//! cgroups.create("sbx-1", &ResourceLimits::from_mib(4.0, 4096))?;
//! cgroups.add_process("sbx-1", driver_pid)?;
//! // ...
//! cgroups.destroy("sbx-1")?;
//! ```
//!
//! When the hierarchy is not writable (no root, cgroups v1, containers
//! without delegation) callers keep running without limits.

pub mod manager;

pub use manager::{CgroupManager, ResourceLimits};
