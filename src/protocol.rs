//! Execution protocol between the host and the in-sandbox driver
//!
//! The host sends one [`ExecuteRequest`] per snippet and waits for the
//! [`ExecuteResponse`] carrying the same `command_id`. On the process runtime
//! both travel as newline-delimited JSON over the driver's stdin/stdout:
//!
//! ```text
//! host                                   driver (guest/driver.py)
//!  │                                        │
//!  │◄──────────── {"ready": true} ──────────┤  after boot
//!  │                                        │
//!  ├── {"command_id", "code", "timeout_ms"} ►│  exec(code, namespace)
//!  │                                        │  scan namespace → captures
//!  │◄── {"command_id", "stdout", "stderr",  ─┤
//!  │     "error", "captures", "duration_ms"} │
//! ```
//!
//! Snippets run against one persistent namespace per sandbox; nothing is
//! rolled back when a snippet raises or times out.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to run one snippet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub command_id: String,
    pub code: String,
    /// Time budget enforced by the driver; `None` uses the driver default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>, timeout_ms: Option<u64>) -> Self {
        Self {
            command_id: Uuid::now_v7().simple().to_string(),
            code: code.into(),
            timeout_ms,
        }
    }

    /// Encode as a single protocol line (including the trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// How a snippet failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    Exception,
    Timeout,
}

/// Structured description of an exception raised by a snippet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub kind: ExceptionKind,
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ExceptionInfo {
    pub fn is_timeout(&self) -> bool {
        self.kind == ExceptionKind::Timeout
    }

    /// `TypeName: message`, the way interpreters print uncaught errors
    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}: {}", self.type_name, self.message)
        }
    }
}

/// Raw visual object found in the namespace after a snippet ran
///
/// The driver fills whichever payload fields it could produce; the host-side
/// capture registry decides what becomes an artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureCandidate {
    /// Recognized type, e.g. `matplotlib.figure`
    pub type_tag: String,
    /// Variable name or expression that produced the object
    pub source: String,
    /// Creation order within one execution
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub png_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// Result of one snippet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub command_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<ExceptionInfo>,
    #[serde(default)]
    pub captures: Vec<CaptureCandidate>,
    #[serde(default)]
    pub duration_ms: f64,
}

impl ExecuteResponse {
    pub fn timed_out(&self) -> bool {
        self.error.as_ref().map(|e| e.is_timeout()).unwrap_or(false)
    }
}

/// A line read from the driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverLine {
    Ready,
    Response(ExecuteResponse),
    /// Anything else the driver printed (logs, stray output)
    Other,
}

#[derive(Deserialize)]
struct ReadyLine {
    ready: bool,
}

/// Classify one line of driver output
pub fn parse_line(line: &str) -> DriverLine {
    let line = line.trim();
    if !line.starts_with('{') {
        return DriverLine::Other;
    }
    if let Ok(ready) = serde_json::from_str::<ReadyLine>(line) {
        return if ready.ready {
            DriverLine::Ready
        } else {
            DriverLine::Other
        };
    }
    match serde_json::from_str::<ExecuteResponse>(line) {
        Ok(response) if !response.command_id.is_empty() => DriverLine::Response(response),
        _ => DriverLine::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_is_single_json_line() {
        let req = ExecuteRequest::new("x = 1\nprint(x)", Some(5000));
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let back: ExecuteRequest = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(back.code, "x = 1\nprint(x)");
    }

    #[test]
    fn test_parse_ready_line() {
        assert_eq!(parse_line("{\"ready\": true}"), DriverLine::Ready);
    }

    #[test]
    fn test_parse_response_with_exception() {
        let line = r#"{"command_id":"abc","stdout":"","stderr":"","error":{"kind":"exception","type_name":"ZeroDivisionError","message":"division by zero","traceback":"Traceback..."},"captures":[],"duration_ms":1.5}"#;
        let DriverLine::Response(resp) = parse_line(line) else {
            panic!("expected response");
        };
        let error = resp.error.unwrap();
        assert_eq!(error.summary(), "ZeroDivisionError: division by zero");
        assert!(!error.is_timeout());
    }

    #[test]
    fn test_parse_ignores_log_lines() {
        assert_eq!(parse_line("Received line: {...}"), DriverLine::Other);
        assert_eq!(parse_line("{\"unrelated\": 1}"), DriverLine::Other);
        assert_eq!(parse_line(""), DriverLine::Other);
    }

    #[test]
    fn test_response_defaults_missing_fields() {
        let DriverLine::Response(resp) = parse_line(r#"{"command_id":"x"}"#) else {
            panic!("expected response");
        };
        assert!(resp.stdout.is_empty());
        assert!(resp.captures.is_empty());
        assert!(!resp.timed_out());
    }
}
