//! Core data model: messages, content blocks, chat options, results, and
//! streaming events.
//!
//! All provider adapters consume and produce these types; nothing
//! vendor-specific leaks out of `src/providers/`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
}

/// Message content: either a plain string or a list of typed blocks.
///
/// Untagged so that `"content": "hi"` and `"content": [{"type": "text", ...}]`
/// both deserialize naturally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to plain text. Non-text blocks are skipped.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// True when nothing in this content would reach the wire.
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.trim().is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

/// A typed content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    Document {
        source: DocumentSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        citations: Option<Value>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Thinking {
        thinking: String,
    },
}

/// Image payload: inline base64 or a URL reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// Document payload for providers with native document support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DocumentSource {
    Text { media_type: String, data: String },
    Base64 { media_type: String, data: String },
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// A user-role message carrying one tool result block.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
            }]),
        }
    }
}

/// Schema for one callable tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

/// Record of one tool call executed during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub input: Value,
    pub result: String,
}

/// Executes tool calls requested by the model. Implemented by the caller.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run the named tool with the given JSON arguments and return its
    /// textual result. Errors abort the whole chat call.
    async fn execute(&self, name: &str, input: &Value) -> Result<String>;
}

/// Reasoning effort hint for providers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

/// Per-call options. Everything is optional; adapters only serialize what
/// their wire format supports after capability negotiation.
#[derive(Clone, Default)]
pub struct ChatOptions {
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    /// Dropped when extended thinking is enabled.
    pub temperature: Option<f32>,
    pub tools: Vec<ToolDefinition>,
    pub tool_executor: Option<Arc<dyn ToolExecutor>>,
    /// Enable extended thinking on providers that have it.
    pub thinking: bool,
    /// Thinking token budget; adapters apply their own default when unset.
    pub thinking_budget: Option<u32>,
    /// Text the assistant's reply must continue from.
    pub prefill: Option<String>,
    /// Mark the system prompt as cacheable on providers with prompt caching.
    pub enable_cache: bool,
    /// Documents to attach (natively or inlined as text).
    pub documents: Vec<ContentBlock>,
    /// Pre-retrieved search results injected ahead of the user turn.
    pub search_results: Vec<SearchResult>,
    /// JSON Schema the response must conform to.
    pub output_format: Option<Value>,
    /// Request strict schema adherence for tool arguments.
    pub strict_tools: bool,
    pub effort: Option<Effort>,
    pub disable_parallel_tool_use: bool,
}

impl std::fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOptions")
            .field("system_prompt", &self.system_prompt)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("tools", &self.tools.len())
            .field("has_executor", &self.tool_executor.is_some())
            .field("thinking", &self.thinking)
            .field("thinking_budget", &self.thinking_budget)
            .field("prefill", &self.prefill)
            .field("enable_cache", &self.enable_cache)
            .field("documents", &self.documents.len())
            .field("search_results", &self.search_results.len())
            .field("output_format", &self.output_format.is_some())
            .field("strict_tools", &self.strict_tools)
            .field("effort", &self.effort)
            .field("disable_parallel_tool_use", &self.disable_parallel_tool_use)
            .finish()
    }
}

/// One pre-retrieved search result passed in via options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub source: String,
    pub title: String,
    pub content: String,
}

/// Token usage for one call, summed across tool rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A citation extracted from a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub cited_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Final result of a chat call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    /// Assembled text: optional `<thinking>` block, then prefill, then answer.
    pub text: String,
    pub usage: Usage,
    pub citations: Vec<Citation>,
    pub tool_usage: Vec<ToolInvocation>,
    /// True when the call succeeded only after rewriting the system prompt
    /// into a leading user message.
    pub system_fallback: bool,
}

/// One round trip's worth of normalized provider output.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub text: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
    pub citations: Vec<Citation>,
    pub stop_reason: Option<String>,
}

/// A complete tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Incremental chunk from a provider stream, already decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Answer text delta.
    Content(String),
    /// Thinking text delta.
    Thinking(String),
    /// Partial tool call; fragments with the same index belong together.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// Usage totals, typically on the final frame.
    Usage(Usage),
    /// Stream finished with an optional stop reason.
    Finished { reason: Option<String> },
}

/// Event delivered to the caller's streaming callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Thinking text delta.
    Thinking { text: String },
    /// Answer text delta.
    Content { text: String },
    /// A tool is about to run.
    ToolStart { name: String },
    /// A tool finished.
    ToolEnd { name: String },
    /// The accumulated text so far should be replaced wholesale, used when
    /// tool rounds produce a revised final answer.
    ContentReplace { text: String },
    /// Terminal event carrying the final result.
    Done { result: ChatResult },
}

/// Callback receiving [`StreamEvent`]s during `stream_chat`.
pub type EventSink = dyn Fn(StreamEvent) + Send + Sync;
