//! Tool registry, dispatch and the built-in `run_code` tool

pub mod registry;
pub mod run_code;
pub mod schema;

pub use registry::{
    DispatchError, RegistryError, Tool, ToolContext, ToolError, ToolOutput, ToolRegistry,
};
pub use run_code::{RunCodeTool, RUN_CODE_TOOL};
pub use schema::{ArgumentError, ParamSpec, ParamType, ToolSchema};
