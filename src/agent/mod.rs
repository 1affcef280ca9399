//! Agent loop and session management
//!
//! # Architecture
//!
//! ```text
//! SessionManager.submit(session, message)
//!        │  cancels the session's running turn, takes its turn lock
//!        ▼
//! AgentLoop.run_turn ──► ModelProvider.complete (with retry)
//!        │                      │ tool calls
//!        │                      ▼
//!        │               ToolRegistry.dispatch ──► run_code
//!        │                                           │
//!        │                                           ▼
//!        │                            SandboxManager.execute(session)
//!        │                                           │
//!        │                                           ▼
//!        │                           driver: persistent namespace + captures
//!        ▼
//! TraceEvent broadcast ──► presentation layers
//! ```

pub mod controller;
pub mod events;
pub mod sessions;

pub use controller::{
    AgentConfig, AgentLoop, LoopState, TurnError, TurnOutcome, TurnReport, DEFAULT_SYSTEM_PROMPT,
};
pub use events::{EventSink, SessionEvent, TraceEvent, EVENT_CHANNEL_CAPACITY};
pub use sessions::{SessionError, SessionInfo, SessionManager, SessionStatus};
