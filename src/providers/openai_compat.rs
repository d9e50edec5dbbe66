//! OpenAI-compatible vendors behind one adapter.
//!
//! Vendors that speak the chat/completions dialect differ only in base URL,
//! auth requirements, and capability flags. Those differences live in a
//! [`CompatProfile`] value instead of per-vendor subtypes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::instrument;

use crate::capabilities::Capabilities;
use crate::error::{GatewayError, Result};
use crate::providers::openai::{convert_message, normalize_completion};
use crate::providers::ChatAdapter;
use crate::sse::{decode_openai_line, sse_chunk_stream};
use crate::types::{ChatMessage, ChatOptions, ChatRole, ProviderResponse, StreamChunk};

/// Per-vendor translation profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatProfile {
    pub service_id: &'static str,
    pub display_name: &'static str,
    pub base_url: &'static str,
    /// Local runtimes construct without a credential.
    pub requires_api_key: bool,
    pub caps: Capabilities,
}

impl CompatProfile {
    pub fn deepseek() -> Self {
        Self {
            service_id: "deepseek",
            display_name: "DeepSeek",
            base_url: "https://api.deepseek.com/v1",
            requires_api_key: true,
            caps: Capabilities {
                // deepseek-reasoner streams reasoning_content deltas
                thinking: true,
                ..Capabilities::default()
            },
        }
    }

    pub fn xai() -> Self {
        Self {
            service_id: "xai",
            display_name: "xAI",
            base_url: "https://api.x.ai/v1",
            requires_api_key: true,
            caps: Capabilities {
                vision: true,
                ..Capabilities::default()
            },
        }
    }

    pub fn fireworks() -> Self {
        Self {
            service_id: "fireworks",
            display_name: "Fireworks AI",
            base_url: "https://api.fireworks.ai/inference/v1",
            requires_api_key: true,
            caps: Capabilities::default(),
        }
    }

    pub fn openrouter() -> Self {
        Self {
            service_id: "openrouter",
            display_name: "OpenRouter",
            base_url: "https://openrouter.ai/api/v1",
            requires_api_key: true,
            caps: Capabilities {
                vision: true,
                ..Capabilities::default()
            },
        }
    }

    pub fn huggingface() -> Self {
        Self {
            service_id: "huggingface",
            display_name: "Hugging Face",
            base_url: "https://router.huggingface.co/v1",
            requires_api_key: true,
            caps: Capabilities {
                aggressive_rate_limits: true,
                ..Capabilities::default()
            },
        }
    }

    pub fn ollama() -> Self {
        Self {
            service_id: "ollama",
            display_name: "Ollama (local)",
            base_url: "http://localhost:11434/v1",
            requires_api_key: false,
            caps: Capabilities::default(),
        }
    }

    /// Look up a profile by service id.
    pub fn for_service(service_id: &str) -> Option<Self> {
        match service_id {
            "deepseek" => Some(Self::deepseek()),
            "xai" => Some(Self::xai()),
            "fireworks" => Some(Self::fireworks()),
            "openrouter" => Some(Self::openrouter()),
            "huggingface" => Some(Self::huggingface()),
            "ollama" => Some(Self::ollama()),
            _ => None,
        }
    }
}

pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    profile: CompatProfile,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl OpenAiCompatAdapter {
    pub fn new(profile: CompatProfile, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: profile.base_url.to_string(),
            profile,
            api_key,
            model: model.into(),
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
    ) -> CompatRequest {
        let mut wire_messages = Vec::new();
        if let Some(sys) = &options.system_prompt {
            wire_messages.push(json!({"role": "system", "content": sys}));
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
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.input_schema,
                            }
                        })
                    })
                    .collect(),
            )
        };

        CompatRequest {
            model: self.model.clone(),
            messages: wire_messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools,
            stream: stream.then_some(true),
            stream_options: stream.then(|| json!({"include_usage": true})),
        }
    }

    async fn post(&self, request: &CompatRequest) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

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

#[derive(Debug, Serialize)]
struct CompatRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

#[async_trait]
impl ChatAdapter for OpenAiCompatAdapter {
    fn service_id(&self) -> &str {
        self.profile.service_id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        self.profile.caps
    }

    #[instrument(skip_all, fields(service = self.profile.service_id, model = %self.model))]
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

    #[instrument(skip_all, fields(service = self.profile.service_id, model = %self.model))]
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
