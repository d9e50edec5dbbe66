//! Service factory: the built-in service catalog, credential resolution,
//! and the adapter cache.
//!
//! The factory is owned by the composing application. It holds no global
//! state; the cache lives inside the factory value and is invalidated
//! explicitly (for example on credential rotation).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::providers::{
    AnthropicAdapter, ChatAdapter, CompatProfile, GeminiAdapter, OpenAiAdapter,
    OpenAiCompatAdapter,
};

/// Credential lookup, implemented by the application.
pub trait ApiKeyStore: Send + Sync {
    fn get_api_key(&self, service_id: &str) -> Option<String>;
}

impl ApiKeyStore for HashMap<String, String> {
    fn get_api_key(&self, service_id: &str) -> Option<String> {
        self.get(service_id).cloned()
    }
}

/// One model entry in the built-in catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub context_window: u32,
}

/// One service entry in the built-in catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ServiceInfo {
    pub id: &'static str,
    pub display_name: &'static str,
    pub base_url: &'static str,
    pub default_model: &'static str,
    pub models: &'static [ModelInfo],
    pub requires_api_key: bool,
}

/// Every service this gateway can talk to.
pub fn service_catalog() -> &'static [ServiceInfo] {
    &CATALOG
}

/// Look up one service by id.
pub fn service_info(service_id: &str) -> Option<&'static ServiceInfo> {
    CATALOG.iter().find(|s| s.id == service_id)
}

static CATALOG: [ServiceInfo; 9] = [
    ServiceInfo {
        id: "anthropic",
        display_name: "Anthropic",
        base_url: "https://api.anthropic.com",
        default_model: "claude-sonnet-4-20250514",
        models: &[
            ModelInfo { id: "claude-opus-4-20250514", context_window: 200_000 },
            ModelInfo { id: "claude-sonnet-4-20250514", context_window: 200_000 },
            ModelInfo { id: "claude-3-7-sonnet-20250219", context_window: 200_000 },
            ModelInfo { id: "claude-3-5-haiku-20241022", context_window: 200_000 },
        ],
        requires_api_key: true,
    },
    ServiceInfo {
        id: "openai",
        display_name: "OpenAI",
        base_url: "https://api.openai.com/v1",
        default_model: "gpt-4o",
        models: &[
            ModelInfo { id: "gpt-4o", context_window: 128_000 },
            ModelInfo { id: "gpt-4o-mini", context_window: 128_000 },
            ModelInfo { id: "o3-mini", context_window: 200_000 },
            ModelInfo { id: "gpt-4.1", context_window: 1_000_000 },
        ],
        requires_api_key: true,
    },
    ServiceInfo {
        id: "google",
        display_name: "Google Gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        default_model: "gemini-2.0-flash",
        models: &[
            ModelInfo { id: "gemini-2.0-flash", context_window: 1_000_000 },
            ModelInfo { id: "gemini-1.5-pro", context_window: 2_000_000 },
            ModelInfo { id: "gemini-1.5-flash", context_window: 1_000_000 },
        ],
        requires_api_key: true,
    },
    ServiceInfo {
        id: "xai",
        display_name: "xAI",
        base_url: "https://api.x.ai/v1",
        default_model: "grok-3",
        models: &[
            ModelInfo { id: "grok-3", context_window: 131_072 },
            ModelInfo { id: "grok-3-mini", context_window: 131_072 },
        ],
        requires_api_key: true,
    },
    ServiceInfo {
        id: "ollama",
        display_name: "Ollama (local)",
        base_url: "http://localhost:11434/v1",
        default_model: "llama3.2",
        models: &[
            ModelInfo { id: "llama3.2", context_window: 128_000 },
            ModelInfo { id: "qwen2.5", context_window: 128_000 },
        ],
        requires_api_key: false,
    },
    ServiceInfo {
        id: "huggingface",
        display_name: "Hugging Face",
        base_url: "https://router.huggingface.co/v1",
        default_model: "meta-llama/Llama-3.3-70B-Instruct",
        models: &[
            ModelInfo { id: "meta-llama/Llama-3.3-70B-Instruct", context_window: 128_000 },
            ModelInfo { id: "Qwen/Qwen2.5-72B-Instruct", context_window: 131_072 },
        ],
        requires_api_key: true,
    },
    ServiceInfo {
        id: "openrouter",
        display_name: "OpenRouter",
        base_url: "https://openrouter.ai/api/v1",
        default_model: "anthropic/claude-sonnet-4",
        models: &[
            ModelInfo { id: "anthropic/claude-sonnet-4", context_window: 200_000 },
            ModelInfo { id: "openai/gpt-4o", context_window: 128_000 },
            ModelInfo { id: "google/gemini-2.0-flash-001", context_window: 1_000_000 },
        ],
        requires_api_key: true,
    },
    ServiceInfo {
        id: "fireworks",
        display_name: "Fireworks AI",
        base_url: "https://api.fireworks.ai/inference/v1",
        default_model: "accounts/fireworks/models/llama-v3p3-70b-instruct",
        models: &[
            ModelInfo {
                id: "accounts/fireworks/models/llama-v3p3-70b-instruct",
                context_window: 131_072,
            },
            ModelInfo {
                id: "accounts/fireworks/models/deepseek-v3",
                context_window: 131_072,
            },
        ],
        requires_api_key: true,
    },
    ServiceInfo {
        id: "deepseek",
        display_name: "DeepSeek",
        base_url: "https://api.deepseek.com/v1",
        default_model: "deepseek-chat",
        models: &[
            ModelInfo { id: "deepseek-chat", context_window: 64_000 },
            ModelInfo { id: "deepseek-reasoner", context_window: 64_000 },
        ],
        requires_api_key: true,
    },
];

/// Outcome of a credential check. A rejected key is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct KeyValidation {
    pub valid: bool,
    pub message: String,
}

/// Result of a model listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModelsListing {
    /// True when the list came from the vendor's live endpoint rather than
    /// the built-in catalog.
    pub live: bool,
    pub models: Vec<String>,
}

/// Builds and caches adapters, keyed `"{service_id}:{model_id}"`.
pub struct ServiceFactory {
    keys: Arc<dyn ApiKeyStore>,
    cache: Mutex<HashMap<String, Arc<dyn ChatAdapter>>>,
    client: reqwest::Client,
    base_url_override: Option<String>,
}

impl ServiceFactory {
    pub fn new(keys: Arc<dyn ApiKeyStore>) -> Self {
        Self {
            keys,
            cache: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
            base_url_override: None,
        }
    }

    /// Point every service at one base URL. For tests against a stub server.
    pub fn with_base_url_override(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into());
        self
    }

    /// Return a cached adapter for `(service_id, model_id)`, building one on
    /// miss. `None` model falls back to the catalog default.
    #[instrument(skip(self))]
    pub async fn create_service(
        &self,
        service_id: &str,
        model_id: Option<&str>,
    ) -> Result<Arc<dyn ChatAdapter>> {
        let info = service_info(service_id).ok_or_else(|| {
            GatewayError::Config(format!("unknown service '{}'", service_id))
        })?;
        let model = model_id.unwrap_or(info.default_model);
        let cache_key = format!("{}:{}", service_id, model);

        let mut cache = self.cache.lock().await;
        if let Some(adapter) = cache.get(&cache_key) {
            return Ok(adapter.clone());
        }

        debug!(service = service_id, model, "building adapter");
        let adapter = self.build_adapter(info, model)?;
        cache.insert(cache_key, adapter.clone());
        Ok(adapter)
    }

    /// Convenience wrapper: a ready-to-use [`Gateway`] for the service.
    pub async fn create_gateway(
        &self,
        service_id: &str,
        model_id: Option<&str>,
    ) -> Result<Gateway> {
        Ok(Gateway::new(self.create_service(service_id, model_id).await?))
    }

    fn build_adapter(&self, info: &ServiceInfo, model: &str) -> Result<Arc<dyn ChatAdapter>> {
        let key = self.keys.get_api_key(info.id);
        if info.requires_api_key && key.is_none() {
            return Err(GatewayError::Config(format!(
                "no API key configured for service '{}'",
                info.id
            )));
        }

        let adapter: Arc<dyn ChatAdapter> = match info.id {
            "anthropic" => {
                let mut a = AnthropicAdapter::new(key.unwrap_or_default(), model);
                if let Some(base) = &self.base_url_override {
                    a = a.with_base_url(base.clone());
                }
                Arc::new(a)
            }
            "openai" => {
                let mut a = OpenAiAdapter::new(key.unwrap_or_default(), model);
                if let Some(base) = &self.base_url_override {
                    a = a.with_base_url(base.clone());
                }
                Arc::new(a)
            }
            "google" => {
                let mut a = GeminiAdapter::new(key.unwrap_or_default(), model);
                if let Some(base) = &self.base_url_override {
                    a = a.with_base_url(base.clone());
                }
                Arc::new(a)
            }
            other => {
                let profile = CompatProfile::for_service(other).ok_or_else(|| {
                    GatewayError::Config(format!("unknown service '{}'", other))
                })?;
                let mut a = OpenAiCompatAdapter::new(profile, key, model);
                if let Some(base) = &self.base_url_override {
                    a = a.with_base_url(base.clone());
                }
                Arc::new(a)
            }
        };
        Ok(adapter)
    }

    /// Drop every cached adapter for one service, for example after its key
    /// rotated.
    pub async fn invalidate(&self, service_id: &str) {
        let prefix = format!("{}:", service_id);
        self.cache
            .lock()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop the whole cache.
    pub async fn invalidate_all(&self) {
        self.cache.lock().await.clear();
    }

    /// Check a credential with the cheapest live call the vendor offers.
    ///
    /// A rejected or unreachable key yields `valid: false` with a message;
    /// only an unknown service id is an error.
    #[instrument(skip(self, key))]
    pub async fn validate_api_key(&self, service_id: &str, key: &str) -> Result<KeyValidation> {
        let info = service_info(service_id).ok_or_else(|| {
            GatewayError::Config(format!("unknown service '{}'", service_id))
        })?;
        if !info.requires_api_key {
            return Ok(KeyValidation {
                valid: true,
                message: format!("{} does not require an API key", info.display_name),
            });
        }

        match self.probe_models(info, key).await {
            Ok(_) => Ok(KeyValidation {
                valid: true,
                message: "API key is valid".into(),
            }),
            Err(GatewayError::Auth(_)) => Ok(KeyValidation {
                valid: false,
                message: "API key was rejected".into(),
            }),
            Err(e) => Ok(KeyValidation {
                valid: false,
                message: format!("could not verify key: {}", e),
            }),
        }
    }

    /// List models, live when the vendor has a listing endpoint and the call
    /// succeeds, else from the built-in catalog.
    #[instrument(skip(self, key))]
    pub async fn get_available_models(
        &self,
        service_id: &str,
        key: Option<&str>,
    ) -> Result<ModelsListing> {
        let info = service_info(service_id).ok_or_else(|| {
            GatewayError::Config(format!("unknown service '{}'", service_id))
        })?;

        if let Some(key) = key {
            if let Ok(models) = self.probe_models(info, key).await {
                if !models.is_empty() {
                    return Ok(ModelsListing { live: true, models });
                }
            }
        }
        Ok(ModelsListing {
            live: false,
            models: info.models.iter().map(|m| m.id.to_string()).collect(),
        })
    }

    /// GET the vendor's models endpoint and pull out the ids.
    async fn probe_models(&self, info: &ServiceInfo, key: &str) -> Result<Vec<String>> {
        let base = self
            .base_url_override
            .as_deref()
            .unwrap_or(info.base_url);
        let request = match info.id {
            "anthropic" => self
                .client
                .get(format!("{}/v1/models", base))
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01"),
            "google" => self
                .client
                .get(format!("{}/models?key={}", base, key)),
            _ => self
                .client
                .get(format!("{}/models", base))
                .bearer_auth(key),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body, None));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            GatewayError::InvalidResponseShape(format!("models response: {}", e))
        })?;
        // OpenAI-style {data:[{id}]}, Anthropic {data:[{id}]}, Google {models:[{name}]}
        let entries = body["data"]
            .as_array()
            .or_else(|| body["models"].as_array())
            .cloned()
            .unwrap_or_default();
        Ok(entries
            .iter()
            .filter_map(|m| {
                m["id"]
                    .as_str()
                    .or_else(|| m["name"].as_str())
                    .map(String::from)
            })
            .collect())
    }
}
