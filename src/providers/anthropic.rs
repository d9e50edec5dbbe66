//! Anthropic Messages API adapter.
//!
//! Wire format: `POST {base}/v1/messages` with `x-api-key` and
//! `anthropic-version` headers. The richest adapter in the crate: native
//! vision, documents with citations, extended thinking, prefill, and prompt
//! caching all map onto dedicated request fields.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::capabilities::Capabilities;
use crate::error::{GatewayError, Result};
use crate::providers::ChatAdapter;
use crate::sse::{sse_chunk_stream, sse_data};
use crate::types::{
    ChatMessage, ChatOptions, ChatRole, Citation, ContentBlock, DocumentSource, ImageSource,
    MessageContent, ProviderResponse, StreamChunk, ToolCallRequest, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_THINKING_BUDGET: u32 = 4096;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> MessagesRequest {
        let system = options.system_prompt.as_ref().map(|sys| {
            if options.enable_cache {
                json!([{
                    "type": "text",
                    "text": sys,
                    "cache_control": {"type": "ephemeral"}
                }])
            } else {
                Value::String(sys.clone())
            }
        });

        let mut wire_messages: Vec<WireMessage> = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(convert_message)
            .collect();
        if let Some(prefill) = &options.prefill {
            wire_messages.push(WireMessage {
                role: "assistant".into(),
                content: Value::String(prefill.clone()),
            });
        }

        let tools = if options.tools.is_empty() {
            None
        } else {
            Some(
                options
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect(),
            )
        };

        let tool_choice = if options.disable_parallel_tool_use && !options.tools.is_empty() {
            Some(json!({"type": "auto", "disable_parallel_tool_use": true}))
        } else {
            None
        };

        let budget = options.thinking_budget.unwrap_or(DEFAULT_THINKING_BUDGET);
        let mut max_tokens = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        // the API requires max_tokens strictly greater than budget_tokens
        if options.thinking && max_tokens <= budget {
            max_tokens = budget + DEFAULT_MAX_TOKENS;
        }
        let thinking = options.thinking.then(|| {
            json!({
                "type": "enabled",
                "budget_tokens": budget,
            })
        });

        MessagesRequest {
            model: self.model.clone(),
            max_tokens,
            messages: wire_messages,
            system,
            stream: stream.then_some(true),
            tools,
            tool_choice,
            temperature: options.temperature,
            thinking,
        }
    }

    async fn post(&self, request: &MessagesRequest, options: &ChatOptions) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        if options.enable_cache {
            builder = builder.header("anthropic-beta", "prompt-caching-2024-07-31");
        }
        let response = builder.json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body, retry_after));
        }
        Ok(response)
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn convert_message(message: &ChatMessage) -> WireMessage {
    let role = match message.role {
        ChatRole::Assistant => "assistant",
        _ => "user",
    };
    let content = match &message.content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => Value::Array(
            blocks
                .iter()
                .filter_map(convert_block)
                .collect(),
        ),
    };
    WireMessage {
        role: role.into(),
        content,
    }
}

fn convert_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
        ContentBlock::Image { source } => {
            let source = match source {
                ImageSource::Base64 { media_type, data } => json!({
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                }),
                ImageSource::Url { url } => json!({"type": "url", "url": url}),
            };
            Some(json!({"type": "image", "source": source}))
        }
        ContentBlock::Document {
            source,
            title,
            citations,
        } => {
            let source = match source {
                DocumentSource::Text { media_type, data } => json!({
                    "type": "text",
                    "media_type": media_type,
                    "data": data,
                }),
                DocumentSource::Base64 { media_type, data } => json!({
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                }),
            };
            let mut doc = json!({"type": "document", "source": source});
            if let Some(title) = title {
                doc["title"] = json!(title);
            }
            if citations.is_some() {
                doc["citations"] = json!({"enabled": true});
            }
            Some(doc)
        }
        ContentBlock::ToolUse { id, name, input } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        })),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => Some(json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
        })),
        // Thinking blocks require provider signatures; never re-sent.
        ContentBlock::Thinking { .. } => None,
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: ResponseUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    citations: Option<Vec<ResponseCitation>>,
}

#[derive(Debug, Deserialize)]
struct ResponseCitation {
    cited_text: String,
    #[serde(default)]
    document_title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn normalize_response(response: MessagesResponse) -> ProviderResponse {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    let mut citations = Vec::new();

    for block in response.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(t) = block.text {
                    text.push_str(&t);
                }
                if let Some(cites) = block.citations {
                    citations.extend(cites.into_iter().map(|c| Citation {
                        cited_text: c.cited_text,
                        source: None,
                        title: c.document_title,
                    }));
                }
            }
            "thinking" => {
                if let Some(t) = block.thinking {
                    thinking.push_str(&t);
                }
            }
            "tool_use" => {
                if let (Some(id), Some(name)) = (block.id, block.name) {
                    tool_calls.push(ToolCallRequest {
                        id,
                        name,
                        input: block.input.unwrap_or_else(|| json!({})),
                    });
                }
            }
            other => debug!(block_type = other, "ignoring unknown content block"),
        }
    }

    ProviderResponse {
        text,
        thinking: if thinking.is_empty() {
            None
        } else {
            Some(thinking)
        },
        tool_calls,
        usage: Usage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
        citations,
        stop_reason: response.stop_reason,
    }
}

// Stream events, tagged by "type".
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEventWire {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: StreamBlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: StreamDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        delta: StreamMessageDelta,
        #[serde(default)]
        usage: Option<StreamDeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: Value,
    },
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    #[serde(default)]
    usage: ResponseUsage,
}

#[derive(Debug, Deserialize)]
struct StreamBlockStart {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta {
        #[allow(dead_code)]
        signature: String,
    },
}

#[derive(Debug, Deserialize)]
struct StreamMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

/// Decode one SSE line into chunks. `input_tokens` carries the value from
/// `message_start` forward to the final usage report.
fn decode_line(line: &str, input_tokens: &mut u32) -> Vec<Result<StreamChunk>> {
    let Some(payload) = sse_data(line) else {
        return Vec::new();
    };
    let event: StreamEventWire = match serde_json::from_str(payload) {
        Ok(ev) => ev,
        Err(e) => {
            warn!(error = %e, "skipping malformed stream event");
            return Vec::new();
        }
    };
    match event {
        StreamEventWire::MessageStart { message } => {
            *input_tokens = message.usage.input_tokens;
            Vec::new()
        }
        StreamEventWire::ContentBlockStart {
            index,
            content_block,
        } => {
            if content_block.block_type == "tool_use" {
                vec![Ok(StreamChunk::ToolCallDelta {
                    index,
                    id: content_block.id,
                    name: content_block.name,
                    arguments: None,
                })]
            } else {
                Vec::new()
            }
        }
        StreamEventWire::ContentBlockDelta { index, delta } => match delta {
            StreamDelta::TextDelta { text } => vec![Ok(StreamChunk::Content(text))],
            StreamDelta::ThinkingDelta { thinking } => vec![Ok(StreamChunk::Thinking(thinking))],
            StreamDelta::InputJsonDelta { partial_json } => vec![Ok(StreamChunk::ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments: Some(partial_json),
            })],
            StreamDelta::SignatureDelta { .. } => Vec::new(),
        },
        StreamEventWire::MessageDelta { delta, usage } => {
            let mut chunks = vec![Ok(StreamChunk::Usage(Usage {
                input_tokens: *input_tokens,
                output_tokens: usage.map(|u| u.output_tokens).unwrap_or_default(),
            }))];
            chunks.push(Ok(StreamChunk::Finished {
                reason: delta.stop_reason,
            }));
            chunks
        }
        StreamEventWire::ContentBlockStop { .. }
        | StreamEventWire::MessageStop
        | StreamEventWire::Ping => Vec::new(),
        StreamEventWire::Error { error } => {
            vec![Err(GatewayError::StreamDecode(error.to_string()))]
        }
    }
}

fn supports_thinking(model: &str) -> bool {
    model.contains("claude-3-7") || model.contains("claude-sonnet-4") || model.contains("claude-opus-4") || model.contains("claude-haiku-4")
}

#[async_trait]
impl ChatAdapter for AnthropicAdapter {
    fn service_id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vision: true,
            documents: true,
            thinking: supports_thinking(&self.model),
            prefill: true,
            prompt_caching: true,
            structured_output: false,
            strict_tools: false,
            effort: false,
            system_role: true,
            streaming: true,
            tool_streaming: true,
            aggressive_rate_limits: true,
        }
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn send(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ProviderResponse> {
        let request = self.build_request(messages, options, false);
        let response = self.post(&request, options).await?;
        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            GatewayError::InvalidResponseShape(format!("messages response: {}", e))
        })?;
        Ok(normalize_response(parsed))
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let request = self.build_request(messages, options, true);
        let response = self.post(&request, options).await?;
        let mut input_tokens = 0u32;
        Ok(sse_chunk_stream(response, move |line| {
            decode_line(line, &mut input_tokens)
        }))
    }
}
