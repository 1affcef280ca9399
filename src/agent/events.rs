//! Trace events for presentation layers
//!
//! The core never touches display state. Everything a UI may want to render
//! is published on a broadcast channel as a [`SessionEvent`]; subscribers
//! filter by `session_id` and render however they like.
//!
//! `MessageAppended` events describe the turn's working history as it grows.
//! That history is committed to the session only when `TurnFinished` is
//! published; after `TurnFailed` or `TurnCancelled` the UI should drop them.

use serde::Serialize;
use tokio::sync::broadcast;

use super::controller::LoopState;
use crate::capture::Artifact;
use crate::conversation::{Message, ToolCall, ToolResult};
use crate::llm::TokenUsage;

/// Default capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    TurnStarted {
        turn_id: String,
    },
    StateChanged {
        turn_id: String,
        state: LoopState,
        iteration: usize,
    },
    MessageAppended {
        turn_id: String,
        message: Message,
    },
    ToolCallStarted {
        turn_id: String,
        call: ToolCall,
    },
    ToolCallFinished {
        turn_id: String,
        result: ToolResult,
    },
    ArtifactAvailable {
        turn_id: String,
        call_id: String,
        artifact: Artifact,
    },
    /// Token usage of one model call plus the running total for the turn
    Usage {
        turn_id: String,
        call: TokenUsage,
        turn_total: TokenUsage,
    },
    TurnFinished {
        turn_id: String,
        /// `done` or `aborted`
        outcome: &'static str,
        iterations: usize,
        answer: String,
    },
    /// User-visible failure; history is unchanged
    TurnFailed {
        turn_id: String,
        error: String,
    },
    TurnCancelled {
        turn_id: String,
    },
    SessionEnded,
}

/// Event tagged with the session it belongs to
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// Publishes events for one session
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: String,
    tx: Option<broadcast::Sender<SessionEvent>>,
}

impl EventSink {
    pub fn new(session_id: impl Into<String>, tx: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            tx: Some(tx),
        }
    }

    /// Sink that drops everything
    pub fn disabled(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tx: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn emit(&self, event: TraceEvent) {
        if let Some(tx) = &self.tx {
            // No subscribers is fine
            let _ = tx.send(SessionEvent {
                session_id: self.session_id.clone(),
                event,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_subscribers_with_session_id() {
        let (tx, mut rx) = broadcast::channel(8);
        let sink = EventSink::new("s1", tx);
        sink.emit(TraceEvent::TurnStarted {
            turn_id: "t1".into(),
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.session_id, "s1");
        assert!(matches!(event.event, TraceEvent::TurnStarted { .. }));
    }

    #[test]
    fn test_serialized_event_is_flat_and_tagged() {
        let event = SessionEvent {
            session_id: "s1".into(),
            event: TraceEvent::TurnCancelled {
                turn_id: "t1".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "turn_cancelled");
        assert_eq!(json["session_id"], "s1");
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        EventSink::disabled("s1").emit(TraceEvent::SessionEnded);
    }
}
