//! Ollama `/api/chat` adapter
//!
//! Converts the conversation into Ollama's message shape, advertises tools as
//! `function` definitions and turns the reply back into an
//! [`AssistantReply`]. Static artifact images ride along on tool messages in
//! the `images` field so vision models can look at their own plots.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::provider::{AssistantReply, ModelProvider, ProviderError, TokenUsage};
use crate::conversation::{Message, Role, ToolCall};
use crate::tools::ToolSchema;

/// Connection settings for an Ollama server
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3".to_string(),
            temperature: 0.0,
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// A message in Ollama's chat format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
struct ToolDefinition<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ToolFunction<'a>,
}

#[derive(Debug, Clone, Serialize)]
struct ToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

/// Ollama-backed [`ModelProvider`]
#[derive(Clone)]
pub struct OllamaProvider {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

/// Conversation → Ollama messages
fn to_wire(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|message| {
            let mut wire = ChatMessage {
                role: message.role().as_str().to_string(),
                content: message.text_content(),
                images: None,
                tool_calls: None,
                tool_name: None,
            };

            let mut images: Vec<String> = message
                .images()
                .map(|image| STANDARD.encode(&image.data))
                .collect();

            match message.role() {
                Role::Assistant => {
                    let calls: Vec<WireToolCall> = message
                        .tool_calls()
                        .map(|call| WireToolCall {
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect();
                    if !calls.is_empty() {
                        wire.tool_calls = Some(calls);
                    }
                }
                Role::Tool => {
                    if let Some(result) = message.tool_result() {
                        wire.content = result.output.clone();
                        wire.tool_name = Some(result.tool_name.clone());
                        images.extend(
                            result
                                .artifacts
                                .iter()
                                .filter_map(|a| a.image.as_ref())
                                .map(|image| STANDARD.encode(&image.bytes)),
                        );
                    }
                }
                Role::System | Role::User => {}
            }

            if !images.is_empty() {
                wire.images = Some(images);
            }
            wire
        })
        .collect()
}

fn tool_definitions(tools: &[ToolSchema]) -> Vec<ToolDefinition<'_>> {
    tools
        .iter()
        .map(|schema| ToolDefinition {
            tool_type: "function",
            function: ToolFunction {
                name: &schema.name,
                description: &schema.description,
                parameters: schema.to_json_schema(),
            },
        })
        .collect()
}

fn call_id() -> String {
    format!("call_{}", Uuid::now_v7().simple())
}

/// Ollama reply → [`AssistantReply`], falling back to tool calls written as JSON text
fn from_wire(response: ChatResponse, tools: &[ToolSchema]) -> Result<AssistantReply, ProviderError> {
    let message = response
        .message
        .ok_or_else(|| ProviderError::InvalidResponse("response has no message".into()))?;

    let usage = (response.prompt_eval_count > 0 || response.eval_count > 0).then(|| TokenUsage {
        prompt_tokens: response.prompt_eval_count,
        completion_tokens: response.eval_count,
    });

    let native: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall::new(call_id(), call.function.name, call.function.arguments))
        .collect();

    if !native.is_empty() {
        return Ok(AssistantReply {
            text: message.content,
            tool_calls: native,
            usage,
        });
    }

    let known: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    let embedded: Vec<ToolCall> = parse_tool_calls_from_text(&message.content)
        .into_iter()
        .filter(|(name, _)| known.contains(&name.as_str()))
        .map(|(name, arguments)| ToolCall::new(call_id(), name, arguments))
        .collect();

    if embedded.is_empty() {
        Ok(AssistantReply {
            text: message.content,
            tool_calls: Vec::new(),
            usage,
        })
    } else {
        // The text was the call itself
        Ok(AssistantReply {
            text: String::new(),
            tool_calls: embedded,
            usage,
        })
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<AssistantReply, ProviderError> {
        let endpoint = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": to_wire(messages),
            "stream": false,
            "options": {
                "temperature": self.config.temperature
            }
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tool_definitions(tools))
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        }

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Err(ProviderError::InvalidResponse("empty response from Ollama".into()));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        from_wire(parsed, tools)
    }
}

impl std::fmt::Debug for OllamaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaProvider")
            .field("config", &self.config)
            .finish()
    }
}

/// Extract `{"name": ..., "arguments": {...}}` objects written as plain text
///
/// Some models print tool calls instead of using the native field. Returns
/// `(name, arguments)` pairs in the order they appear.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<(String, Value)> {
    let content = content.trim();
    if let Some(call) = try_parse_tool_call(content) {
        return vec![call];
    }

    let mut calls = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(call) = start.take().and_then(|s| try_parse_tool_call(&content[s..=i])) {
                        calls.push(call);
                    }
                }
            }
            _ => {}
        }
    }
    calls
}

fn try_parse_tool_call(json_str: &str) -> Option<(String, Value)> {
    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return tool_call_from_value(&value);
    }
    let repaired = repair_unescaped_code(json_str)?;
    let value = serde_json::from_str::<Value>(&repaired).ok()?;
    tool_call_from_value(&value)
}

/// Escape bare quotes inside a `"code": "..."` value, the usual way models break the JSON
fn repair_unescaped_code(json_str: &str) -> Option<String> {
    let marker = "\"code\": \"";
    let value_start = json_str.find(marker)? + marker.len();
    let remaining = &json_str[value_start..];
    let value_end = remaining.rfind("\"}")?;

    let escaped = remaining[..value_end]
        .replace("\\\"", "\u{FFFF}")
        .replace('"', "\\\"")
        .replace('\u{FFFF}', "\\\"");

    Some(format!(
        "{}{}{}",
        &json_str[..value_start],
        escaped,
        &remaining[value_end..]
    ))
}

fn tool_call_from_value(value: &Value) -> Option<(String, Value)> {
    let name = value.get("name")?.as_str()?.to_string();
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))?
        .clone();
    // Some models double-encode the arguments
    let arguments = match arguments {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    };
    Some((name, arguments))
}
