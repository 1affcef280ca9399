//! TOML configuration with environment overrides
//!
//! Precedence, lowest first: built-in defaults, the config file, `AGENTBOX_*`
//! environment variables, CLI flags (applied by the binary).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::cgroups::ResourceLimits;
use crate::llm::{OllamaConfig, RetryPolicy};
use crate::sandbox::{ProcessRuntimeConfig, SandboxManagerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub parallel_tool_calls: bool,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            system_prompt: None,
            parallel_tool_calls: true,
            execution_timeout_secs: default_execution_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: 0.0,
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,
    /// 0 disables idle eviction
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 0 disables lifetime eviction
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u64,
    #[serde(default = "default_true")]
    pub resource_limits: bool,
    #[serde(default)]
    pub init_script: Option<String>,
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            create_timeout_secs: default_create_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            cpu_cores: default_cpu_cores(),
            memory_mib: default_memory_mib(),
            resource_limits: true,
            init_script: None,
            work_root: default_work_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub json_logs: bool,
    /// OTLP collector endpoint; console logging only when unset
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json_logs: false,
            otlp_endpoint: None,
        }
    }
}

/// Semantically invalid configuration values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("agent.max_iterations must be at least 1")]
    ZeroIterations,
    #[error("provider.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("sandbox.cpu_cores must be positive, got {0}")]
    InvalidCpu(f64),
    #[error("sandbox.interpreter must not be empty")]
    EmptyInterpreter,
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> usize {
    10
}

fn default_execution_timeout_secs() -> u64 {
    300
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Ollama
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "qwen3".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_create_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_max_lifetime_secs() -> u64 {
    7200
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_cpu_cores() -> f64 {
    4.0
}

fn default_memory_mib() -> u64 {
    4096
}

fn default_work_root() -> PathBuf {
    env::temp_dir().join("agentbox")
}

fn default_log_filter() -> String {
    "info,agentbox=debug".to_string()
}

impl AppConfig {
    /// Read `path` if it exists, otherwise start from defaults; then apply env overrides
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            Self::from_toml(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str::<AppConfig>(text)?)
    }

    /// Apply `AGENTBOX_*` overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("AGENTBOX_MODEL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.provider.model = trimmed.to_owned();
            }
        }
        if let Some(v) = lookup("AGENTBOX_OLLAMA_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.provider.base_url = trimmed.trim_end_matches('/').to_owned();
            }
        }
        if let Some(v) = lookup("AGENTBOX_MAX_ITERATIONS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.agent.max_iterations = n;
            }
        }
        if let Some(v) = lookup("AGENTBOX_OTLP_ENDPOINT") {
            let trimmed = v.trim();
            self.telemetry.otlp_endpoint = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.provider.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if !(self.sandbox.cpu_cores > 0.0) {
            return Err(ConfigError::InvalidCpu(self.sandbox.cpu_cores));
        }
        if self.sandbox.interpreter.trim().is_empty() {
            return Err(ConfigError::EmptyInterpreter);
        }
        Ok(())
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_iterations: self.agent.max_iterations,
            system_prompt: self.agent.system_prompt.clone(),
            parallel_tool_calls: self.agent.parallel_tool_calls,
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.execution_timeout_secs)
    }

    pub fn ollama_config(&self) -> OllamaConfig {
        OllamaConfig {
            base_url: self.provider.base_url.clone(),
            model: self.provider.model.clone(),
            temperature: self.provider.temperature,
            request_timeout: Duration::from_secs(self.provider.request_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.provider.max_attempts,
            base_delay: Duration::from_millis(self.provider.base_delay_ms),
            max_delay: Duration::from_millis(self.provider.max_delay_ms),
        }
    }

    pub fn sandbox_manager_config(&self) -> SandboxManagerConfig {
        let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        SandboxManagerConfig {
            create_timeout: Duration::from_secs(self.sandbox.create_timeout_secs),
            idle_timeout: optional(self.sandbox.idle_timeout_secs),
            max_lifetime: optional(self.sandbox.max_lifetime_secs),
            init_script: self.sandbox.init_script.clone(),
            ..Default::default()
        }
    }

    pub fn process_runtime_config(&self) -> ProcessRuntimeConfig {
        ProcessRuntimeConfig {
            interpreter: self.sandbox.interpreter.clone(),
            work_root: self.sandbox.work_root.clone(),
            limits: self
                .sandbox
                .resource_limits
                .then(|| ResourceLimits::from_mib(self.sandbox.cpu_cores, self.sandbox.memory_mib)),
            env: Vec::new(),
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.sandbox.reaper_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 10);
        assert_eq!(cfg.provider.model, "qwen3");
        assert_eq!(cfg.provider.kind, ProviderKind::Ollama);
        assert_eq!(cfg.sandbox.memory_mib, 4096);
        assert_eq!(cfg.telemetry.log_filter, "info,agentbox=debug");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [agent]
            max_iterations = 4

            [sandbox]
            idle_timeout_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent.max_iterations, 4);
        assert!(cfg.agent.parallel_tool_calls);
        assert_eq!(cfg.provider.base_url, "http://localhost:11434");
        let sandbox = cfg.sandbox_manager_config();
        assert!(sandbox.idle_timeout.is_none());
        assert_eq!(sandbox.max_lifetime, Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_unknown_provider_kind_rejected() {
        assert!(AppConfig::from_toml("[provider]\nkind = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AGENTBOX_MODEL", "llama3.2"),
            ("AGENTBOX_OLLAMA_URL", "http://gpu-box:11434/"),
            ("AGENTBOX_MAX_ITERATIONS", "25"),
        ]
        .into_iter()
        .collect();
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.provider.model, "llama3.2");
        assert_eq!(cfg.provider.base_url, "http://gpu-box:11434");
        assert_eq!(cfg.agent.max_iterations, 25);
    }

    #[test]
    fn test_bad_iteration_override_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|key| (key == "AGENTBOX_MAX_ITERATIONS").then(|| "lots".to_string()));
        assert_eq!(cfg.agent.max_iterations, 10);
    }

    #[test]
    fn test_validation() {
        let mut cfg = AppConfig::default();
        cfg.agent.max_iterations = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroIterations)));

        let mut cfg = AppConfig::default();
        cfg.sandbox.cpu_cores = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidCpu(_))));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.agent.execution_timeout_secs, 300);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentbox.toml");
        std::fs::write(&path, "[sandbox]\nresource_limits = false\ninterpreter = \"python3.12\"\n")
            .unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        let runtime = cfg.process_runtime_config();
        assert_eq!(runtime.interpreter, "python3.12");
        assert!(runtime.limits.is_none());
    }
}
