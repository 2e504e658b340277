//! Model gateway: one chat-completions call per round, with lenient response
//! parsing and recovery for empty or truncated output.
//!
//! Soft problems (null content, malformed memory blocks, truncation) are fixed
//! up here and never surface as errors. Transport problems become a single
//! [`GatewayError`] for the caller to handle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::BotConfig;
use crate::memory::directive::extract_memories;
use crate::memory::ProposedMemory;
use crate::tools::{ToolCallResult, ToolDef};

/// Shown whenever the model produced nothing usable.
pub const FALLBACK_REPLY: &str = "brrr... I didn't quite get that. Try asking in another way?";

const LOG_PREVIEW_CHARS: usize = 500;
const MAX_ACKNOWLEDGED_KEYS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("network error talking to the model provider: {0}")]
    Network(String),
    #[error("model request timed out after {0:?}")]
    Timeout(Duration),
    #[error("model provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode model response: {0}")]
    Decode(String),
}

/// A message in the request (OpenAI format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::text("user", content)
    }

    fn assistant_tool_calls(calls: &[LlmToolCall]) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(calls.to_vec()),
            tool_call_id: None,
            name: None,
        }
    }

    fn tool_result(result: &ToolCallResult) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(result.content()),
            tool_calls: None,
            tool_call_id: Some(result.call_id.clone()),
            name: Some(result.name.clone()),
        }
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Per-call generation settings.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Empty means the request carries no tool schema at all.
    pub tools: Vec<ToolDef>,
}

/// One round's outcome. `content` is never empty.
#[derive(Debug, Clone)]
pub struct ModelTurnResult {
    pub content: String,
    pub memories: Vec<ProposedMemory>,
    pub tool_calls: Vec<LlmToolCall>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
}

impl ModelTurnResult {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Raw request/response exchange with the provider.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatCompletionRequest) -> Result<Value, GatewayError>;
}

/// The operations the turn orchestrator needs from the model.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        options: &ModelOptions,
    ) -> Result<ModelTurnResult, GatewayError>;

    async fn continue_with_tool_results(
        &self,
        system_prompt: &str,
        user_message: &str,
        prior_tool_calls: &[LlmToolCall],
        tool_results: &[ToolCallResult],
        options: &ModelOptions,
    ) -> Result<ModelTurnResult, GatewayError>;
}

// ============================================================================
// HTTP transport
// ============================================================================

pub struct HttpTransport {
    url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(api_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for the model provider")?;
        Ok(Self {
            url: format!("{}/chat/completions", api_url.trim_end_matches('/')),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            timeout,
            client,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatCompletionRequest) -> Result<Value, GatewayError> {
        let mut req = self.client.post(&self.url).json(request);

        // Local providers may not need a key
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(GatewayError::Status { status, body });
        }

        let body = response.text().await.map_err(|e| self.map_error(e))?;
        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct LlmClient {
    transport: Arc<dyn ChatTransport>,
    model: String,
    fallback_model: String,
    retry_max_tokens: u32,
    /// Serializes every upstream call in the process.
    gate: Mutex<()>,
}

struct ParsedCompletion {
    content: String,
    tool_calls: Vec<LlmToolCall>,
    finish_reason: Option<String>,
    usage: Usage,
}

impl LlmClient {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        model: impl Into<String>,
        fallback_model: impl Into<String>,
        retry_max_tokens: u32,
    ) -> Self {
        Self {
            transport,
            model: model.into(),
            fallback_model: fallback_model.into(),
            retry_max_tokens,
            gate: Mutex::new(()),
        }
    }

    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let transport = HttpTransport::new(
            &config.llm_api_url,
            config.llm_api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self::new(
            Arc::new(transport),
            config.llm_model.clone(),
            config.llm_fallback_model.clone(),
            config.retry_max_tokens,
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
        tools: &[ToolDef],
    ) -> ChatCompletionRequest {
        let (tools, tool_choice) = if tools.is_empty() {
            (None, None)
        } else {
            (Some(tools.to_vec()), Some("auto".to_string()))
        };
        ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature,
            max_tokens,
            tools,
            tool_choice,
        }
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<Value, GatewayError> {
        log_request(request);
        let _gate = self.gate.lock().await;
        let result = self.transport.send(request).await;
        match &result {
            Ok(raw) => log_response(raw),
            Err(e) => tracing::error!("LLM request failed: {}", e),
        }
        result
    }

    async fn run_round(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: &str,
        user_message: &str,
        options: &ModelOptions,
    ) -> Result<ModelTurnResult, GatewayError> {
        let request = Self::build_request(
            &self.model,
            messages,
            options.temperature,
            options.max_tokens,
            &options.tools,
        );
        let raw = self.send(&request).await?;
        let parsed = parse_completion(&raw);

        let extracted = extract_memories(&parsed.content);
        let mut content = extracted.visible;
        let memories = extracted.memories;
        let mut usage = parsed.usage;

        if content.trim().is_empty() && !memories.is_empty() {
            content = acknowledge_memories(&memories);
        }

        if content.trim().is_empty()
            && parsed.tool_calls.is_empty()
            && parsed.finish_reason.as_deref() == Some("length")
        {
            tracing::debug!(
                "Empty content with finish_reason=length; retrying single-turn with {}",
                self.fallback_model
            );
            match self
                .retry_truncated(system_prompt, user_message, options)
                .await
            {
                Ok(Some((retried, retry_usage))) => {
                    content = retried;
                    usage = retry_usage;
                }
                Ok(None) => tracing::warn!("Truncation retry also came back empty"),
                Err(e) => tracing::warn!("Truncation retry failed: {}", e),
            }
        }

        if content.trim().is_empty() {
            content = FALLBACK_REPLY.to_string();
        }

        Ok(ModelTurnResult {
            content,
            memories,
            tool_calls: parsed.tool_calls,
            usage,
            finish_reason: parsed.finish_reason,
        })
    }

    async fn retry_truncated(
        &self,
        system_prompt: &str,
        user_message: &str,
        options: &ModelOptions,
    ) -> Result<Option<(String, Usage)>, GatewayError> {
        let request = Self::build_request(
            &self.fallback_model,
            vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_message),
            ],
            options.temperature,
            options.max_tokens.min(self.retry_max_tokens),
            &[],
        );
        let parsed = parse_completion(&self.send(&request).await?);
        let content = parsed.content.trim();
        if content.is_empty() {
            Ok(None)
        } else {
            Ok(Some((content.to_string(), parsed.usage)))
        }
    }
}

#[async_trait]
impl ModelGateway for LlmClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        options: &ModelOptions,
    ) -> Result<ModelTurnResult, GatewayError> {
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_message),
        ];
        self.run_round(messages, system_prompt, user_message, options)
            .await
    }

    async fn continue_with_tool_results(
        &self,
        system_prompt: &str,
        user_message: &str,
        prior_tool_calls: &[LlmToolCall],
        tool_results: &[ToolCallResult],
        options: &ModelOptions,
    ) -> Result<ModelTurnResult, GatewayError> {
        let mut messages = Vec::with_capacity(3 + tool_results.len());
        messages.push(ChatMessage::system(system_prompt));
        messages.push(ChatMessage::user(user_message));
        messages.push(ChatMessage::assistant_tool_calls(prior_tool_calls));
        messages.extend(tool_results.iter().map(ChatMessage::tool_result));
        self.run_round(messages, system_prompt, user_message, options)
            .await
    }
}

// ============================================================================
// Response parsing
// ============================================================================

fn parse_completion(raw: &Value) -> ParsedCompletion {
    let first_choice = match raw.get("choices") {
        Some(Value::Array(choices)) => choices.first(),
        Some(choice @ Value::Object(_)) => Some(choice),
        _ => None,
    };
    let message = first_choice.and_then(|choice| choice.get("message"));

    let content = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, call)| parse_tool_call(idx, call))
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = first_choice
        .and_then(|choice| choice.get("finish_reason"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let usage = raw
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();

    ParsedCompletion {
        content,
        tool_calls,
        finish_reason,
        usage,
    }
}

fn parse_tool_call(idx: usize, call: &Value) -> Option<LlmToolCall> {
    let function = call.get("function")?;
    let name = function.get("name").and_then(Value::as_str)?.to_string();
    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    };
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", idx));
    Some(LlmToolCall {
        id,
        call_type: "function".to_string(),
        function: LlmFunctionCall { name, arguments },
    })
}

fn acknowledge_memories(memories: &[ProposedMemory]) -> String {
    let keys: Vec<&str> = memories
        .iter()
        .filter_map(|m| m.key.as_deref())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .take(MAX_ACKNOWLEDGED_KEYS)
        .collect();
    if keys.is_empty() {
        "Got it, I'll remember that.".to_string()
    } else {
        format!("Got it, I'll remember that ({}).", keys.join(", "))
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > LOG_PREVIEW_CHARS {
        let head: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn log_request(request: &ChatCompletionRequest) {
    tracing::debug!(
        "LLM request: model={} temperature={} max_tokens={} tools={} messages={}",
        request.model,
        request.temperature,
        request.max_tokens,
        request.tools.as_ref().map_or(0, Vec::len),
        request.messages.len()
    );
    for (i, msg) in request.messages.iter().enumerate() {
        tracing::debug!(
            "  [{}] {}: {}",
            i,
            msg.role,
            preview(msg.content.as_deref().unwrap_or(""))
        );
        if let Some(calls) = &msg.tool_calls {
            let names: Vec<&str> = calls.iter().map(|c| c.function.name.as_str()).collect();
            tracing::debug!("      tool_calls: {:?}", names);
        }
        if let Some(id) = &msg.tool_call_id {
            tracing::debug!("      tool_call_id: {}", id);
        }
    }
}

fn log_response(raw: &Value) {
    let parsed = parse_completion(raw);
    tracing::debug!(
        "LLM response: finish_reason={:?} tool_calls={} usage={}/{}/{} content: {}",
        parsed.finish_reason,
        parsed.tool_calls.len(),
        parsed.usage.prompt_tokens,
        parsed.usage.completion_tokens,
        parsed.usage.total_tokens,
        preview(&parsed.content)
    );
}
