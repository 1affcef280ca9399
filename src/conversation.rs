//! Conversation data model shared by the agent loop, tools and providers
//!
//! A conversation is an append-only sequence of [`Message`]s. Each message has
//! a role and an ordered list of content parts:
//!
//! ```text
//! History
//! ├── Message { role: System,    parts: [Text] }
//! ├── Message { role: User,      parts: [Text] }
//! ├── Message { role: Assistant, parts: [Text, ToolCall, ToolCall] }
//! ├── Message { role: Tool,      parts: [ToolResult] }      ← one per ToolCall,
//! ├── Message { role: Tool,      parts: [ToolResult] }        in call order
//! └── Message { role: Assistant, parts: [Text] }            ← final answer
//! ```
//!
//! Messages are immutable once built: fields are private and only readable
//! through accessors. [`History`] only grows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::Artifact;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier the matching [`ToolResult`] refers back to
    pub id: String,
    /// Name of the tool to invoke
    pub name: String,
    /// Structured arguments, validated against the tool's schema before dispatch
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Category of a failed tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments did not match the declared schema
    Argument,
    /// The model asked for a tool that is not registered
    UnknownTool,
    /// The executed snippet raised an exception
    Execution,
    /// The executed snippet exceeded its time budget
    Timeout,
    /// The tool implementation reported a recoverable failure
    Tool,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Argument => "argument_error",
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::Execution => "execution_error",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Tool => "tool_error",
        }
    }
}

/// Error descriptor attached to a [`ToolResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub kind: ToolErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ToolErrorInfo {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

/// Observation returned for exactly one [`ToolCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Back-reference to the originating call
    pub call_id: String,
    pub tool_name: String,
    /// Textual output (stdout/stderr or a rendered error)
    pub output: String,
    /// Visual artifacts; they live exactly as long as this result
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl ToolResult {
    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn failure(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: ToolErrorInfo,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output: error.message.clone(),
            artifacts: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Inline image attached to a message (e.g. uploaded by the user)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub mime: String,
    pub data: Vec<u8>,
}

/// One ordered piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Image(ImageRef),
}

/// An immutable conversation entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    parts: Vec<ContentPart>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    /// User message carrying images alongside the text
    pub fn user_with_images(content: impl Into<String>, images: Vec<ImageRef>) -> Self {
        let mut parts = vec![ContentPart::Text {
            text: content.into(),
        }];
        parts.extend(images.into_iter().map(ContentPart::Image));
        Self {
            role: Role::User,
            parts,
        }
    }

    /// Assistant message; empty text is omitted so tool-only replies stay clean
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let content = content.into();
        let mut parts = Vec::with_capacity(tool_calls.len() + 1);
        if !content.is_empty() {
            parts.push(ContentPart::Text { text: content });
        }
        parts.extend(tool_calls.into_iter().map(ContentPart::ToolCall));
        Self {
            role: Role::Assistant,
            parts,
        }
    }

    pub fn tool(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![ContentPart::ToolResult(result)],
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text {
                text: content.into(),
            }],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    /// Concatenated text parts
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        self.parts.iter().find_map(|part| match part {
            ContentPart::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::Image(image) => Some(image),
            _ => None,
        })
    }
}

/// Append-only ordered conversation history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages appended after the first `base` entries
    pub fn since(&self, base: usize) -> &[Message] {
        self.messages.get(base..).unwrap_or(&[])
    }

    pub fn starts_with_system(&self) -> bool {
        self.messages
            .first()
            .map(|m| m.role() == Role::System)
            .unwrap_or(false)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_message_parts_order() {
        let msg = Message::assistant(
            "Let me check.",
            vec![
                ToolCall::new("a", "run_code", serde_json::json!({"code": "1"})),
                ToolCall::new("b", "run_code", serde_json::json!({"code": "2"})),
            ],
        );
        assert_eq!(msg.role(), Role::Assistant);
        assert_eq!(msg.parts().len(), 3);
        let ids: Vec<_> = msg.tool_calls().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(msg.text_content(), "Let me check.");
    }

    #[test]
    fn test_tool_only_assistant_has_no_text_part() {
        let msg = Message::assistant("", vec![ToolCall::new("a", "t", Value::Null)]);
        assert_eq!(msg.parts().len(), 1);
        assert!(msg.text_content().is_empty());
    }

    #[test]
    fn test_history_since() {
        let mut history = History::new();
        history.push(Message::system("sys"));
        history.push(Message::user("hi"));
        let base = history.len();
        history.push(Message::assistant("hello", vec![]));

        assert!(history.starts_with_system());
        assert_eq!(history.since(base).len(), 1);
        assert!(history.since(10).is_empty());
    }

    #[test]
    fn test_failure_result_carries_message_as_output() {
        let result = ToolResult::failure(
            "c1",
            "run_code",
            ToolErrorInfo::new(ToolErrorKind::Argument, "missing required argument `code`"),
        );
        assert!(result.is_error());
        assert_eq!(result.output, "missing required argument `code`");
    }

    #[test]
    fn test_message_serialization_tags_parts() {
        let msg = Message::user("test message");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("\"type\":\"text\""));
    }
}
