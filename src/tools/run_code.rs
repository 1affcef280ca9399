//! `run_code`: execute a snippet in the session's sandbox

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::registry::{Tool, ToolContext, ToolError, ToolOutput};
use super::schema::{ParamType, ToolSchema};
use crate::conversation::{ToolErrorInfo, ToolErrorKind};
use crate::sandbox::{Execution, SandboxManager};

pub const RUN_CODE_TOOL: &str = "run_code";

/// Output beyond this many characters is cut before it reaches the model
const MAX_OUTPUT_CHARS: usize = 20_000;

/// Runs Python in a persistent per-session namespace
pub struct RunCodeTool {
    sandboxes: Arc<SandboxManager>,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl RunCodeTool {
    pub fn new(sandboxes: Arc<SandboxManager>, default_timeout: Duration) -> Self {
        Self {
            sandboxes,
            default_timeout,
            max_timeout: default_timeout.max(Duration::from_secs(1)),
        }
    }

    fn timeout_for(&self, arguments: &Value) -> Duration {
        match arguments.get("timeout_secs").and_then(Value::as_u64) {
            Some(secs) => Duration::from_secs(secs.max(1)).min(self.max_timeout),
            None => self.default_timeout,
        }
    }
}

#[async_trait]
impl Tool for RunCodeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            RUN_CODE_TOOL,
            "Execute Python code in a sandbox. Variables, imports and definitions persist \
             between calls in the same conversation. Printed output, errors and any \
             matplotlib/plotly figures or PIL images are returned.",
        )
        .required("code", ParamType::String, "Python source to execute")
        .optional(
            "timeout_secs",
            ParamType::Integer,
            "Time budget in seconds (defaults to the server limit)",
        )
        .at_least(1)
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: Value) -> Result<ToolOutput, ToolError> {
        let code = arguments
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed("`code` must be a string".into()))?;
        let timeout = self.timeout_for(&arguments);

        let execution = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Failed("execution cancelled".into()));
            }
            result = self.sandboxes.execute(&ctx.session_id, code, timeout) => result?,
        };

        Ok(to_output(execution))
    }
}

fn to_output(execution: Execution) -> ToolOutput {
    let error = execution.response.error.as_ref().map(|e| {
        let kind = if e.is_timeout() {
            ToolErrorKind::Timeout
        } else {
            ToolErrorKind::Execution
        };
        let info = ToolErrorInfo::new(kind, e.summary());
        match &e.traceback {
            Some(tb) => info.with_traceback(tb.clone()),
            None => info,
        }
    });

    ToolOutput {
        output: render(&execution),
        artifacts: execution.artifacts,
        error,
    }
}

/// Text observation: stdout first, then labelled sections for everything else
pub fn render(execution: &Execution) -> String {
    let response = &execution.response;
    let mut text = String::new();

    if execution.recovered {
        text.push_str("[note] The sandbox was restarted after a crash; previously defined variables are gone.\n");
    }
    if !response.stdout.is_empty() {
        text.push_str(&response.stdout);
        if !response.stdout.ends_with('\n') {
            text.push('\n');
        }
    }
    if !response.stderr.is_empty() {
        let _ = writeln!(text, "[stderr]\n{}", response.stderr.trim_end());
    }
    if let Some(error) = &response.error {
        let _ = writeln!(text, "[error] {}", error.summary());
        if let Some(tb) = &error.traceback {
            let _ = writeln!(text, "{}", tb.trim_end());
        }
    }
    if !execution.artifacts.is_empty() {
        text.push_str("[artifacts]\n");
        for artifact in &execution.artifacts {
            let _ = writeln!(
                text,
                "- {} ({}, {})",
                artifact.source,
                artifact.type_tag,
                artifact.kind.as_str()
            );
        }
    }

    if text.is_empty() {
        return "(no output)".to_string();
    }
    truncate(text.trim_end())
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    format!(
        "{}\n[output truncated to {} characters]",
        kept, MAX_OUTPUT_CHARS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Artifact, ArtifactKind};
    use crate::protocol::{ExceptionInfo, ExceptionKind, ExecuteResponse};

    fn execution(response: ExecuteResponse) -> Execution {
        Execution {
            sandbox_id: "sbx-1".into(),
            response,
            artifacts: Vec::new(),
            skipped_captures: Vec::new(),
            recovered: false,
        }
    }

    #[test]
    fn test_render_empty_output() {
        assert_eq!(render(&execution(ExecuteResponse::default())), "(no output)");
    }

    #[test]
    fn test_render_sections() {
        let mut exec = execution(ExecuteResponse {
            command_id: "c".into(),
            stdout: "42".into(),
            stderr: "warning\n".into(),
            error: Some(ExceptionInfo {
                kind: ExceptionKind::Exception,
                type_name: "ValueError".into(),
                message: "bad".into(),
                traceback: Some("Traceback ...".into()),
            }),
            ..Default::default()
        });
        exec.artifacts.push(Artifact {
            id: "a1".into(),
            kind: ArtifactKind::StaticImage,
            source: "figure 1".into(),
            type_tag: "matplotlib.figure".into(),
            sequence: 0,
            image: None,
            document: None,
        });

        let text = render(&exec);
        assert!(text.starts_with("42\n[stderr]\nwarning\n[error] ValueError: bad\nTraceback ..."));
        assert!(text.ends_with("- figure 1 (matplotlib.figure, static_image)"));
    }

    #[test]
    fn test_timeout_maps_to_timeout_kind() {
        let output = to_output(execution(ExecuteResponse {
            command_id: "c".into(),
            error: Some(ExceptionInfo {
                kind: ExceptionKind::Timeout,
                type_name: "TimeoutError".into(),
                message: "execution exceeded 1.0s".into(),
                traceback: None,
            }),
            ..Default::default()
        }));
        assert_eq!(output.error.unwrap().kind, ToolErrorKind::Timeout);
    }

    #[test]
    fn test_truncate_long_output() {
        let long = "x".repeat(MAX_OUTPUT_CHARS + 10);
        let cut = truncate(&long);
        assert!(cut.ends_with("characters]"));
        assert!(cut.len() < long.len() + 50);
    }
}
