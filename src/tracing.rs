//! Logging and OpenTelemetry tracing
//!
//! Console logging is always on (plain or JSON). Spans are additionally
//! exported over OTLP when an endpoint is configured.
//!
//! # Span layout
//!
//! ```text
//! agent_turn (session_id, turn_id)
//!  ├── llm_call (provider, attempt)
//!  └── tool_call (tool, call_id)
//!       └── code_execution (sandbox_id)
//! sandbox_provision (session_id, sandbox_id)
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log filter when neither `RUST_LOG` nor a configured filter is set
pub const DEFAULT_LOG_FILTER: &str = "info,agentbox=debug";

/// Logging options
#[derive(Debug, Clone, Default)]
pub struct TracingOptions<'a> {
    /// Filter directives; `RUST_LOG` wins when set
    pub filter: Option<&'a str>,
    /// Emit JSON lines instead of human-readable logs
    pub json: bool,
    /// OTLP collector endpoint (e.g. "http://localhost:4317")
    pub otlp_endpoint: Option<&'a str>,
}

/// Initialize the tracing subsystem
///
/// # Example
/// ```ignore
/// init_tracing("agentbox", TracingOptions { otlp_endpoint: Some("http://localhost:4317"), ..Default::default() })?;
/// ```
pub fn init_tracing(
    service_name: &str,
    options: TracingOptions<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_layer = match options.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let plain_layer = (!options.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });
    let json_layer = options
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(options.filter.unwrap_or(DEFAULT_LOG_FILTER))
    });

    let exporting = otel_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(plain_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(endpoint) = options.otlp_endpoint {
        tracing::info!(service = service_name, endpoint, "OpenTelemetry tracing initialized");
    } else {
        tracing::debug!(service = service_name, exporting, "Console logging initialized");
    }

    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("Tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_enables_crate_debug() {
        assert!(DEFAULT_LOG_FILTER.contains("agentbox=debug"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_default_options_are_console_only() {
        let options = TracingOptions::default();
        assert!(options.otlp_endpoint.is_none());
        assert!(!options.json);
    }
}
