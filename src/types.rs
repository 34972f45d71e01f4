// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for Conductor.
//!
//! This module defines the LLM wire-level data structures shared by the
//! router, the providers and the orchestrator: messages, content blocks,
//! tool definitions, completion requests and responses, and stream events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Type of content block within a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBlockType {
    Text,
    ToolUse,
    ToolResult,
}

/// A block of content within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: ContentBlockType,

    /// Text content (for text blocks)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Unique identifier for tool_use blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Tool name for tool_use blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Input parameters for tool_use blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    /// Associated tool_use_id for tool_result blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,

    /// Result content for tool_result blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Whether this tool_result represents an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ContentBlock {
    /// Create a text content block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            block_type: ContentBlockType::Text,
            text: Some(text.into()),
            id: None,
            name: None,
            input: None,
            tool_use_id: None,
            content: None,
            is_error: None,
        }
    }

    /// Create a tool_use content block.
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            block_type: ContentBlockType::ToolUse,
            text: None,
            id: Some(id.into()),
            name: Some(name.into()),
            input: Some(input),
            tool_use_id: None,
            content: None,
            is_error: None,
        }
    }

    /// Create a tool_result content block.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            block_type: ContentBlockType::ToolResult,
            text: None,
            id: None,
            name: None,
            input: None,
            tool_use_id: Some(tool_use_id.into()),
            content: Some(content.into()),
            is_error: if is_error { Some(true) } else { None },
        }
    }
}

/// Message content - either a simple string or structured content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    /// Create a user message with text content.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create an assistant message with text content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a message with content blocks.
    pub fn with_blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Get text content if this message has simple text content.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(s) => Some(s),
            MessageContent::Blocks(_) => None,
        }
    }

    /// Get content blocks if this message has structured content.
    pub fn as_blocks(&self) -> Option<&[ContentBlock]> {
        match &self.content {
            MessageContent::Text(_) => None,
            MessageContent::Blocks(blocks) => Some(blocks),
        }
    }

    /// Whether this message carries tool results.
    pub fn is_tool_result(&self) -> bool {
        self.as_blocks()
            .map(|blocks| blocks.iter().any(|b| b.block_type == ContentBlockType::ToolResult))
            .unwrap_or(false)
    }
}

// ============================================================================
// Tool Definitions
// ============================================================================

/// JSON Schema for tool input parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type")]
    pub schema_type: String, // Always "object"
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

impl InputSchema {
    /// Create a new input schema with object type.
    pub fn new() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: None,
        }
    }

    /// Add a property to the schema.
    pub fn with_property(mut self, name: impl Into<String>, schema: serde_json::Value) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Mark properties as required.
    pub fn with_required(mut self, required: &[&str]) -> Self {
        self.required = Some(required.iter().map(|s| s.to_string()).collect());
        self
    }
}

impl Default for InputSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Definition of a tool that can be called by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::new(),
        }
    }

    /// Set the input schema for this tool.
    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }
}

/// A call to a tool made by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

// ============================================================================
// Completion Request & Response
// ============================================================================

/// A single request to an LLM backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model name. `None` lets the endpoint use its configured default.
    pub model: Option<String>,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Create a request with just a message list.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            system: None,
            messages,
            tools: Vec::new(),
            max_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Token usage information from a provider response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Get total tokens (input + output).
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Reason why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    /// Parse the wire representation, defaulting to `EndTurn`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            _ => Self::EndTurn,
        }
    }
}

/// Response from an LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Content blocks in the order the model produced them.
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ProviderResponse {
    /// Create a text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(content)],
            stop_reason: StopReason::EndTurn,
            usage: None,
        }
    }

    /// Create a response requesting the given tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: calls
                .into_iter()
                .map(|c| ContentBlock::tool_use(c.id, c.name, c.input))
                .collect(),
            stop_reason: StopReason::ToolUse,
            usage: None,
        }
    }

    /// Text segments in order.
    pub fn text_segments(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter(|b| b.block_type == ContentBlockType::Text)
            .filter_map(|b| b.text.as_deref())
            .collect()
    }

    /// Tool-use requests in order.
    pub fn tool_uses(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter(|b| b.block_type == ContentBlockType::ToolUse)
            .filter_map(|b| {
                Some(ToolCall {
                    id: b.id.clone()?,
                    name: b.name.clone()?,
                    input: b.input.clone().unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }
}

// ============================================================================
// Streaming Types
// ============================================================================

/// Events emitted during streaming responses.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk of text content.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart { id: String, name: String },

    /// A chunk of tool input JSON.
    ToolInputDelta(String),

    /// End of a tool use block.
    ToolUseEnd,

    /// Stream completed with stop reason.
    Done(StopReason),

    /// An error occurred during streaming.
    Error(String),
}

// ============================================================================
// Provider Trait
// ============================================================================

use async_trait::async_trait;
use crate::error::ProviderError;

/// Trait implemented by every LLM backend.
///
/// The router owns one provider per endpoint and never calls a provider
/// concurrently beyond the endpoint's configured capacity.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a completion request.
    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderResponse, ProviderError>;

    /// Send a streaming completion request, reporting incremental events.
    async fn stream(
        &self,
        request: &CompletionRequest,
        on_event: Box<dyn Fn(StreamEvent) + Send + Sync>,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Lightweight liveness probe.
    async fn health_check(&self) -> bool;

    /// Name of this provider for display purposes.
    fn name(&self) -> &str;
}

/// Arc-wrapped provider for shared ownership.
pub type SharedProvider = std::sync::Arc<dyn Provider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello, world!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.as_text(), Some("Hello, world!"));
        assert!(!msg.is_tool_result());
    }

    #[test]
    fn test_tool_result_message() {
        let msg = Message::with_blocks(
            Role::User,
            vec![ContentBlock::tool_result("t1", "ok", false)],
        );
        assert!(msg.is_tool_result());
    }

    #[test]
    fn test_tool_definition() {
        let tool = ToolDefinition::new("read_file", "Read contents of a file").with_schema(
            InputSchema::new()
                .with_property("path", serde_json::json!({"type": "string"}))
                .with_required(&["path"]),
        );

        assert_eq!(tool.name, "read_file");
        assert!(tool.input_schema.properties.contains_key("path"));
        assert_eq!(tool.input_schema.required, Some(vec!["path".to_string()]));
    }

    #[test]
    fn test_response_partitions_text_and_tools() {
        let response = ProviderResponse {
            content: vec![
                ContentBlock::text("Let me check."),
                ContentBlock::tool_use("a", "list_issues", serde_json::json!({})),
                ContentBlock::text("And spawn."),
                ContentBlock::tool_use("b", "spawn_worker", serde_json::json!({"issue_id": 1})),
            ],
            stop_reason: StopReason::ToolUse,
            usage: None,
        };

        assert_eq!(response.text_segments(), vec!["Let me check.", "And spawn."]);
        let calls = response.tool_uses();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "list_issues");
        assert_eq!(calls[1].name, "spawn_worker");
    }

    #[test]
    fn test_stop_reason_from_wire() {
        assert_eq!(StopReason::from_wire("stop_sequence"), StopReason::StopSequence);
        assert_eq!(StopReason::from_wire("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::from_wire("something_new"), StopReason::EndTurn);
    }

    #[test]
    fn test_content_block_serialization() {
        let block = ContentBlock::tool_use("id1", "merge_issue", serde_json::json!({"issue_id": 3}));
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"type\":\"tool_use\""));
        assert!(json.contains("\"name\":\"merge_issue\""));
    }
}
