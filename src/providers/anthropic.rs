// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Anthropic Messages API provider.
//!
//! One instance talks to one endpoint URL. Endpoints may be the public API or
//! any compatible proxy; every request carries the model, system prompt,
//! message list and tool catalog, and every response carries content blocks
//! plus a stop reason.
//!
//! # Features
//!
//! - Non-streaming and SSE streaming completions
//! - Tool use blocks in both directions
//! - A `GET /health` liveness probe used by the router

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{
    CompletionRequest, ContentBlock, Message, MessageContent, Provider,
    ProviderResponse, Role, StopReason, StreamEvent, TokenUsage, ToolDefinition,
};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default max tokens if not specified.
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Anthropic Messages API provider bound to one endpoint.
pub struct AnthropicProvider {
    name: String,
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    health_timeout: Duration,
}

impl AnthropicProvider {
    /// Create a new provider.
    ///
    /// # Arguments
    ///
    /// * `name` - Endpoint name used in logs
    /// * `base_url` - API base URL (without the `/v1/messages` suffix)
    /// * `model` - Default model when a request does not name one
    /// * `api_key` - Optional API key (proxies often need none)
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
            .build()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            client,
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_timeout: Duration::from_secs(5),
        })
    }

    /// Set the timeout used by the health probe.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Build the request body for the Messages API.
    fn build_request(&self, request: &CompletionRequest, stream: bool) -> AnthropicRequest {
        AnthropicRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: request.messages.iter().map(ApiMessage::from).collect(),
            system: request.system.clone(),
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools.iter().map(ApiTool::from).collect())
            },
            stream: Some(stream),
        }
    }

    fn post(&self, body: &AnthropicRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body);
        if let Some(ref key) = self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    /// Parse an SSE event line.
    fn parse_sse_event(line: &str) -> Option<(&str, &str)> {
        if let Some(data) = line.strip_prefix("event: ") {
            Some(("event", data.trim()))
        } else if let Some(data) = line.strip_prefix("data: ") {
            Some(("data", data.trim()))
        } else {
            None
        }
    }

    /// Handle an error response from the API.
    fn handle_error_response(status_code: u16, body: &str) -> ProviderError {
        if let Ok(error) = serde_json::from_str::<ApiError>(body) {
            match error.error.error_type.as_str() {
                "authentication_error" => ProviderError::AuthError(error.error.message),
                "rate_limit_error" => ProviderError::RateLimited(error.error.message),
                "overloaded_error" => ProviderError::RateLimited("API overloaded".to_string()),
                _ => ProviderError::api(error.error.message, status_code),
            }
        } else {
            ProviderError::api(body.to_string(), status_code)
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request(request, false);
        debug!(endpoint = %self.name, model = %body.model, messages = body.messages.len(), "Sending completion request");

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::handle_error_response(status.as_u16(), &error_text));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(api_response.into())
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        on_event: Box<dyn Fn(StreamEvent) + Send + Sync>,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request(request, true);
        debug!(endpoint = %self.name, model = %body.model, "Sending streaming request");

        let mut response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::handle_error_response(status.as_u16(), &error_text));
        }

        let mut state = StreamState::default();
        let mut current_event_type = String::new();
        let mut pending = String::new();

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ProviderError::StreamError(e.to_string()))?
        {
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                match Self::parse_sse_event(line) {
                    Some(("event", value)) => current_event_type = value.to_string(),
                    Some(("data", value)) => {
                        if let Err(e) = state.apply(&current_event_type, value, on_event.as_ref()) {
                            on_event(StreamEvent::Error(e.to_string()));
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(state.into_response())
    }

    async fn health_check(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(endpoint = %self.name, error = %e, "Health probe failed");
                false
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Stream State
// ============================================================================

/// State accumulated during streaming.
#[derive(Default)]
struct StreamState {
    blocks: Vec<ContentBlock>,
    stop_reason: Option<StopReason>,
    input_tokens: u32,
    output_tokens: u32,
    current_text: Option<String>,
    current_tool: Option<(String, String)>,
    current_tool_input: String,
}

impl StreamState {
    /// Apply a single SSE data event.
    fn apply(
        &mut self,
        event_type: &str,
        data: &str,
        on_event: &(dyn Fn(StreamEvent) + Send + Sync),
    ) -> Result<(), ProviderError> {
        let parse_err = |e: serde_json::Error| ProviderError::ParseError(e.to_string());
        match event_type {
            "message_start" => {
                let msg: MessageStartEvent = serde_json::from_str(data).map_err(parse_err)?;
                if let Some(usage) = msg.message.usage {
                    self.input_tokens = usage.input_tokens;
                }
            }
            "content_block_start" => {
                let block: ContentBlockStartEvent = serde_json::from_str(data).map_err(parse_err)?;
                match block.content_block.block_type.as_str() {
                    "text" => self.current_text = Some(String::new()),
                    "tool_use" => {
                        if let (Some(id), Some(name)) = (block.content_block.id, block.content_block.name) {
                            on_event(StreamEvent::ToolUseStart {
                                id: id.clone(),
                                name: name.clone(),
                            });
                            self.current_tool = Some((id, name));
                            self.current_tool_input.clear();
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta: ContentBlockDeltaEvent = serde_json::from_str(data).map_err(parse_err)?;
                match delta.delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.delta.text {
                            self.current_text.get_or_insert_with(String::new).push_str(&text);
                            on_event(StreamEvent::TextDelta(text));
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.delta.partial_json {
                            self.current_tool_input.push_str(&partial);
                            on_event(StreamEvent::ToolInputDelta(partial));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(text) = self.current_text.take() {
                    self.blocks.push(ContentBlock::text(text));
                }
                if let Some((id, name)) = self.current_tool.take() {
                    let input = if self.current_tool_input.trim().is_empty() {
                        serde_json::Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&self.current_tool_input).map_err(parse_err)?
                    };
                    self.blocks.push(ContentBlock::tool_use(id, name, input));
                    self.current_tool_input.clear();
                    on_event(StreamEvent::ToolUseEnd);
                }
            }
            "message_delta" => {
                let delta: MessageDeltaEvent = serde_json::from_str(data).map_err(parse_err)?;
                if let Some(stop_reason) = delta.delta.stop_reason {
                    self.stop_reason = Some(StopReason::from_wire(&stop_reason));
                }
                if let Some(usage) = delta.usage {
                    self.output_tokens = usage.output_tokens;
                }
            }
            "message_stop" => {
                on_event(StreamEvent::Done(self.stop_reason.unwrap_or(StopReason::EndTurn)));
            }
            "error" => {
                let error: StreamErrorEvent = serde_json::from_str(data).map_err(parse_err)?;
                return Err(ProviderError::StreamError(error.error.message));
            }
            _ => {}
        }
        Ok(())
    }

    fn into_response(self) -> ProviderResponse {
        ProviderResponse {
            content: self.blocks,
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            usage: Some(TokenUsage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
            }),
        }
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Request body for the Messages API.
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// API message format.
#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

/// Content can be a string or array of blocks.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Tool definition in API format.
#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

/// A content block as returned by the API.
#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

/// API response format.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

/// Token usage in API format.
#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct MessageStartMessage {
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    content_block: ContentBlockStart,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    delta: ContentBlockDelta,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    #[serde(default)]
    usage: Option<MessageDeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamErrorEvent {
    error: ApiErrorDetail,
}

// ============================================================================
// Type Conversions
// ============================================================================

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = match &msg.content {
            MessageContent::Text(s) => ApiContent::Text(s.clone()),
            MessageContent::Blocks(blocks) => ApiContent::Blocks(blocks.clone()),
        };
        Self { role, content }
    }
}

impl From<&ToolDefinition> for ApiTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: serde_json::to_value(&tool.input_schema).unwrap_or_default(),
        }
    }
}

impl From<ApiResponse> for ProviderResponse {
    fn from(response: ApiResponse) -> Self {
        let content = response
            .content
            .into_iter()
            .filter_map(|block| match block.block_type.as_str() {
                "text" => block.text.map(ContentBlock::text),
                "tool_use" => match (block.id, block.name) {
                    (Some(id), Some(name)) => Some(ContentBlock::tool_use(
                        id,
                        name,
                        block.input.unwrap_or(serde_json::Value::Object(Default::default())),
                    )),
                    _ => None,
                },
                _ => None,
            })
            .collect::<Vec<_>>();

        let stop_reason = response
            .stop_reason
            .as_deref()
            .map(StopReason::from_wire)
            .unwrap_or(StopReason::EndTurn);

        Self {
            content,
            stop_reason,
            usage: response.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
        }
    }
}
