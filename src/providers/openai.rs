//! OpenAI chat/completions adapter.
//!
//! Reasoning models (`o1`/`o3`/`o4`/`gpt-5` families) take
//! `max_completion_tokens` and `reasoning_effort` and reject `temperature`;
//! everything else uses the classic fields.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::instrument;

use crate::capabilities::Capabilities;
use crate::error::{GatewayError, Result};
use crate::providers::ChatAdapter;
use crate::sse::{decode_openai_line, sse_chunk_stream};
use crate::types::{
    ChatMessage, ChatOptions, ChatRole, ContentBlock, ImageSource, MessageContent,
    ProviderResponse, StreamChunk, ToolCallRequest, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiAdapter {
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

    fn is_reasoning_model(&self) -> bool {
        let m = self.model.as_str();
        m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") || m.contains("gpt-5")
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> CompletionRequest {
        let mut wire_messages = Vec::new();
        if let Some(sys) = &options.system_prompt {
            // Reasoning models call this role "developer".
            let role = if self.is_reasoning_model() {
                "developer"
            } else {
                "system"
            };
            wire_messages.push(json!({"role": role, "content": sys}));
        }
        wire_messages.extend(
            messages
                .iter()
                .filter(|m| m.role != ChatRole::System)
                .flat_map(convert_message),
        );

        let tools = if options.tools.is_empty() {
            None
        } else {
            Some(
                options
                    .tools
                    .iter()
                    .map(|t| {
                        let mut function = json!({
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        });
                        if options.strict_tools {
                            function["strict"] = json!(true);
                        }
                        json!({"type": "function", "function": function})
                    })
                    .collect(),
            )
        };

        let response_format = options.output_format.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "response",
                    "schema": schema,
                    "strict": true,
                }
            })
        });

        let reasoning = self.is_reasoning_model();
        CompletionRequest {
            model: self.model.clone(),
            messages: wire_messages,
            max_tokens: if reasoning { None } else { options.max_tokens },
            max_completion_tokens: if reasoning { options.max_tokens } else { None },
            temperature: if reasoning { None } else { options.temperature },
            tools,
            response_format,
            reasoning_effort: if reasoning {
                options.effort.map(|e| {
                    match e {
                        crate::types::Effort::Low => "low",
                        crate::types::Effort::Medium => "medium",
                        crate::types::Effort::High => "high",
                    }
                    .to_string()
                })
            } else {
                None
            },
            parallel_tool_calls: options
                .disable_parallel_tool_use
                .then_some(false)
                .filter(|_| !options.tools.is_empty()),
            stream: stream.then_some(true),
            stream_options: stream.then(|| json!({"include_usage": true})),
        }
    }

    async fn post(&self, request: &CompletionRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body, retry_after));
        }
        Ok(response)
    }
}

/// Convert one message. Tool results become their own `tool`-role messages,
/// so a single input message can expand to several wire messages.
pub(crate) fn convert_message(message: &ChatMessage) -> Vec<Value> {
    match (&message.role, &message.content) {
        (ChatRole::Assistant, MessageContent::Blocks(blocks)) => {
            let text: String = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            let tool_calls: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input.to_string()},
                    })),
                    _ => None,
                })
                .collect();
            let mut msg = json!({"role": "assistant"});
            msg["content"] = if text.is_empty() {
                Value::Null
            } else {
                json!(text)
            };
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls);
            }
            vec![msg]
        }
        (_, MessageContent::Blocks(blocks)) => {
            let mut out = Vec::new();
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => out.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    })),
                    ContentBlock::Text { text } => parts.push(json!({"type": "text", "text": text})),
                    ContentBlock::Image { source } => {
                        let url = match source {
                            ImageSource::Url { url } => url.clone(),
                            ImageSource::Base64 { media_type, data } => {
                                format!("data:{};base64,{}", media_type, data)
                            }
                        };
                        parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                    }
                    // degraded upstream for providers without the capability
                    _ => {}
                }
            }
            if !parts.is_empty() {
                out.push(json!({"role": wire_role(message.role), "content": parts}));
            }
            out
        }
        (_, MessageContent::Text(text)) => {
            vec![json!({"role": wire_role(message.role), "content": text})]
        }
    }
}

fn wire_role(role: ChatRole) -> &'static str {
    match role {
        ChatRole::Assistant => "assistant",
        ChatRole::System => "system",
        ChatRole::Tool => "tool",
        ChatRole::User => "user",
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

pub(crate) fn normalize_completion(body: Value) -> Result<ProviderResponse> {
    let response: CompletionResponse = serde_json::from_value(body)?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::InvalidResponseShape("response has no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let input = if tc.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| json!({}))
            };
            ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                input,
            }
        })
        .collect();

    Ok(ProviderResponse {
        text: choice.message.content.unwrap_or_default(),
        thinking: choice.message.reasoning_content.filter(|t| !t.is_empty()),
        tool_calls,
        usage: response
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
        citations: Vec::new(),
        stop_reason: choice.finish_reason,
    })
}

#[async_trait]
impl ChatAdapter for OpenAiAdapter {
    fn service_id(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vision: true,
            structured_output: true,
            strict_tools: true,
            effort: self.is_reasoning_model(),
            ..Capabilities::default()
        }
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn send(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ProviderResponse> {
        let request = self.build_request(messages, options, false);
        let response = self.post(&request).await?;
        let body: Value = response.json().await.map_err(|e| {
            GatewayError::InvalidResponseShape(format!("completion response: {}", e))
        })?;
        normalize_completion(body)
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let request = self.build_request(messages, options, true);
        let response = self.post(&request).await?;
        Ok(sse_chunk_stream(response, |line| {
            decode_openai_line(line).into_iter().map(Ok).collect()
        }))
    }
}
