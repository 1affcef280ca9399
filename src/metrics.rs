//! Prometheus metrics for agent turns, tool calls and sandboxes
//!
//! All metrics are registered once in a process-wide registry. Render them
//! with [`gather_text`] for a `/metrics` endpoint or the `agentbox metrics`
//! command.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, Gauge, Histogram, HistogramVec, IntCounter,
    IntCounterVec, Registry, TextEncoder,
};

lazy_static! {
    /// Registry holding every agentbox metric
    pub static ref REGISTRY: Registry = Registry::new_custom(Some("agentbox".to_string()), None)
        .expect("metrics registry prefix is valid");

    // ── Agent loop ────────────────────────────────────────────────────────

    /// Completed turns by outcome (done, aborted, cancelled, failed)
    pub static ref AGENT_TURNS: IntCounterVec = register_int_counter_vec_with_registry!(
        "agent_turns_total",
        "Agent turns by outcome",
        &["outcome"],
        REGISTRY
    ).expect("metric can be registered");

    /// Think/act/observe cycles per turn
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram_with_registry!(
        "agent_iterations",
        "Think/act/observe cycles per turn",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0],
        REGISTRY
    ).expect("metric can be registered");

    /// Tool calls by tool and status (ok, argument_error, execution_error, ...)
    pub static ref TOOL_CALLS: IntCounterVec = register_int_counter_vec_with_registry!(
        "tool_calls_total",
        "Tool calls by tool name and status",
        &["tool", "status"],
        REGISTRY
    ).expect("metric can be registered");

    // ── Execution ─────────────────────────────────────────────────────────

    /// Code executions by status (success, error, timeout, crashed)
    pub static ref CODE_EXECUTIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "code_executions_total",
        "Snippet executions by status",
        &["status"],
        REGISTRY
    ).expect("metric can be registered");

    /// Wall-clock duration of snippet executions
    pub static ref CODE_EXECUTION_DURATION: Histogram = register_histogram_with_registry!(
        "code_execution_duration_seconds",
        "Snippet execution duration",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0],
        REGISTRY
    ).expect("metric can be registered");

    /// Artifacts captured by kind
    pub static ref ARTIFACTS_CAPTURED: IntCounterVec = register_int_counter_vec_with_registry!(
        "artifacts_captured_total",
        "Visual artifacts captured after executions",
        &["kind"],
        REGISTRY
    ).expect("metric can be registered");

    // ── Sandboxes ─────────────────────────────────────────────────────────

    /// Cold-start time of a sandbox
    pub static ref SANDBOX_PROVISION_DURATION: Histogram = register_histogram_with_registry!(
        "sandbox_provision_duration_seconds",
        "Time to provision a sandbox",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        REGISTRY
    ).expect("metric can be registered");

    /// Sandboxes currently bound to sessions
    pub static ref SANDBOXES_ACTIVE: Gauge = register_gauge_with_registry!(
        "sandboxes_active",
        "Sandboxes currently bound to sessions",
        REGISTRY
    ).expect("metric can be registered");

    /// Crash recoveries (fresh sandbox provisioned after an unreachable one)
    pub static ref SANDBOX_RECOVERIES: IntCounter = register_int_counter_with_registry!(
        "sandbox_recoveries_total",
        "Sandboxes re-provisioned after a crash",
        REGISTRY
    ).expect("metric can be registered");

    // ── Model provider ────────────────────────────────────────────────────

    /// Model call latency by provider
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        "llm_call_duration_seconds",
        "Model provider call duration",
        &["provider"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        REGISTRY
    ).expect("metric can be registered");

    /// Retried model calls by provider
    pub static ref LLM_RETRIES: IntCounterVec = register_int_counter_vec_with_registry!(
        "llm_retries_total",
        "Model provider calls retried after a transient error",
        &["provider"],
        REGISTRY
    ).expect("metric can be registered");
}

/// Render all metrics in the Prometheus text exposition format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_prefixed_names() {
        AGENT_TURNS.with_label_values(&["done"]).inc();
        TOOL_CALLS.with_label_values(&["run_code", "ok"]).inc();
        let text = gather_text();
        assert!(text.contains("agentbox_agent_turns_total"));
        assert!(text.contains("agentbox_tool_calls_total"));
    }
}
