//! Sandbox lifecycle: per-session isolated execution environments
//!
//! - [`runtime`]: the opaque isolation backend (`create`/`destroy`/`execute`)
//! - [`handle`]: one provisioned sandbox and its status
//! - [`manager`]: acquire/release, crash recovery, eviction
//! - [`process`]: backend that runs each sandbox as an interpreter process

pub mod handle;
pub mod manager;
pub mod process;
pub mod runtime;

pub use handle::{Sandbox, SandboxStatus};
pub use manager::{Execution, SandboxError, SandboxManager, SandboxManagerConfig};
pub use process::{ProcessRuntime, ProcessRuntimeConfig, DRIVER_SOURCE};
pub use runtime::{RuntimeError, RuntimeHandle, SandboxRuntime, SandboxSpec};
