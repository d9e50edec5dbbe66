//! Google Gemini adapter.
//!
//! The odd one out: `contents`/`parts` bodies, the assistant role is called
//! `model`, tools are `functionDeclarations`, and the API key travels in the
//! query string rather than a header. Function calls carry no ids, so the
//! tool name doubles as the id and `functionResponse` routes by name.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::capabilities::Capabilities;
use crate::error::{GatewayError, Result};
use crate::providers::ChatAdapter;
use crate::sse::{sse_chunk_stream, sse_data};
use crate::types::{
    ChatMessage, ChatOptions, ChatRole, ContentBlock, ImageSource, MessageContent,
    ProviderResponse, StreamChunk, ToolCallRequest, Usage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiAdapter {
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

    fn build_request(&self, messages: &[ChatMessage], options: &ChatOptions) -> GenerateRequest {
        let contents = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(convert_message)
            .collect();

        let system_instruction = options
            .system_prompt
            .as_ref()
            .map(|sys| json!({"parts": [{"text": sys}]}));

        let tools = if options.tools.is_empty() {
            None
        } else {
            Some(vec![json!({
                "functionDeclarations": options
                    .tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }))
                    .collect::<Vec<_>>(),
            })])
        };

        let mut generation_config = json!({});
        if let Some(max) = options.max_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }
        if let Some(temp) = options.temperature {
            generation_config["temperature"] = json!(temp);
        }
        if let Some(schema) = &options.output_format {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = schema.clone();
        }
        let generation_config = match generation_config.as_object() {
            Some(fields) if !fields.is_empty() => Some(generation_config.clone()),
            _ => None,
        };

        GenerateRequest {
            contents,
            system_instruction,
            tools,
            generation_config,
        }
    }

    async fn post(&self, method: &str, query: &str, request: &GenerateRequest) -> Result<reqwest::Response> {
        let url = format!(
            "{}/models/{}:{}?key={}{}",
            self.base_url, self.model, method, self.api_key, query
        );
        let response = self.client.post(url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body, None));
        }
        Ok(response)
    }
}

fn convert_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        ChatRole::Assistant => "model",
        _ => "user",
    };
    let parts: Vec<Value> = match &message.content {
        MessageContent::Text(text) => vec![json!({"text": text})],
        MessageContent::Blocks(blocks) => blocks.iter().filter_map(convert_block).collect(),
    };
    json!({"role": role, "parts": parts})
}

fn convert_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({"text": text})),
        ContentBlock::Image { source } => match source {
            ImageSource::Base64 { media_type, data } => Some(json!({
                "inlineData": {"mimeType": media_type, "data": data}
            })),
            // No URL part type; degrade to a visible text notice.
            ImageSource::Url { url } => {
                warn!(url = %url, "image URLs are not supported, replacing with text notice");
                Some(json!({"text": "[image unavailable: URL images are not supported]"}))
            }
        },
        ContentBlock::ToolUse { name, input, .. } => Some(json!({
            "functionCall": {"name": name, "args": input}
        })),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => Some(json!({
            "functionResponse": {
                "name": tool_use_id,
                "response": {"result": content},
            }
        })),
        ContentBlock::Document { .. } | ContentBlock::Thinking { .. } => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

fn normalize_response(response: GenerateResponse) -> Result<ProviderResponse> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::InvalidResponseShape("response has no candidates".into()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(content) = candidate.content {
        for part in content.parts {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(fc) = part.function_call {
                tool_calls.push(ToolCallRequest {
                    id: fc.name.clone(),
                    name: fc.name,
                    input: fc.args,
                });
            }
        }
    }

    Ok(ProviderResponse {
        text,
        thinking: None,
        tool_calls,
        usage: response
            .usage_metadata
            .map(|u| Usage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            })
            .unwrap_or_default(),
        citations: Vec::new(),
        stop_reason: candidate.finish_reason,
    })
}

/// Decode one SSE frame of a `streamGenerateContent?alt=sse` response.
/// `tool_index` numbers function calls across the stream.
fn decode_line(line: &str, tool_index: &mut usize) -> Vec<Result<StreamChunk>> {
    let Some(payload) = sse_data(line) else {
        return Vec::new();
    };
    let frame: GenerateResponse = match serde_json::from_str(payload) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "skipping malformed stream frame");
            return Vec::new();
        }
    };

    let mut chunks = Vec::new();
    for candidate in frame.candidates {
        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        chunks.push(Ok(StreamChunk::Content(text)));
                    }
                }
                if let Some(fc) = part.function_call {
                    chunks.push(Ok(StreamChunk::ToolCallDelta {
                        index: *tool_index,
                        id: Some(fc.name.clone()),
                        name: Some(fc.name),
                        arguments: Some(fc.args.to_string()),
                    }));
                    *tool_index += 1;
                }
            }
        }
        if let Some(reason) = candidate.finish_reason {
            chunks.push(Ok(StreamChunk::Finished {
                reason: Some(reason),
            }));
        }
    }
    if let Some(u) = frame.usage_metadata {
        chunks.push(Ok(StreamChunk::Usage(Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        })));
    }
    chunks
}

#[async_trait]
impl ChatAdapter for GeminiAdapter {
    fn service_id(&self) -> &str {
        "google"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vision: true,
            structured_output: true,
            ..Capabilities::default()
        }
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn send(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ProviderResponse> {
        let request = self.build_request(messages, options);
        let response = self.post("generateContent", "", &request).await?;
        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            GatewayError::InvalidResponseShape(format!("generateContent response: {}", e))
        })?;
        normalize_response(parsed)
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let request = self.build_request(messages, options);
        let response = self
            .post("streamGenerateContent", "&alt=sse", &request)
            .await?;
        let mut tool_index = 0usize;
        Ok(sse_chunk_stream(response, move |line| {
            decode_line(line, &mut tool_index)
        }))
    }
}
