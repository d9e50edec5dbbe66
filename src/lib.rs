//! # soul-llm
//!
//! Multi-provider AI chat gateway: one `chat`/`stream_chat` interface over a
//! dozen vendor chat APIs, with request normalization, SSE stream decoding,
//! a bounded tool-execution loop, capability negotiation, and retry with
//! graceful degradation.
//!
//! ## Quick start
//!
//! ```no_run
//! use soul_llm::{ApiKeyStore, ChatMessage, ChatOptions, ServiceFactory};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn run() -> soul_llm::Result<()> {
//! let mut keys = HashMap::new();
//! keys.insert("anthropic".to_string(), "sk-ant-...".to_string());
//!
//! let factory = ServiceFactory::new(Arc::new(keys));
//! let gateway = factory.create_gateway("anthropic", None).await?;
//! let result = gateway
//!     .chat(&[ChatMessage::user("2+2?")], &ChatOptions::default())
//!     .await?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```
//!
//! ## Layering
//!
//! - [`types`]: normalized messages, options, results, stream events
//! - [`capabilities`]: per-provider flags and explicit option negotiation
//! - [`normalize`]: provider-agnostic message preparation and degradation
//! - [`providers`]: one [`providers::ChatAdapter`] per vendor wire format
//! - [`sse`]: line buffering and stream decoding primitives
//! - [`gateway`]: the tool loop, retries, and result assembly
//! - [`factory`]: service catalog, credentials, and the adapter cache

pub mod capabilities;
pub mod error;
pub mod factory;
pub mod gateway;
pub mod normalize;
pub mod providers;
pub mod retry;
pub mod sse;
pub mod types;

pub use capabilities::{negotiate, Capabilities, DroppedOption};
pub use error::{GatewayError, Result};
pub use factory::{
    service_catalog, service_info, ApiKeyStore, KeyValidation, ModelInfo, ModelsListing,
    ServiceFactory, ServiceInfo,
};
pub use gateway::{Gateway, MAX_TOOL_ROUNDS};
pub use providers::{
    AnthropicAdapter, ChatAdapter, CompatProfile, GeminiAdapter, MockAdapter, OpenAiAdapter,
    OpenAiCompatAdapter,
};
pub use retry::RetryPolicy;
pub use types::{
    ChatMessage, ChatOptions, ChatResult, ChatRole, Citation, ContentBlock, DocumentSource,
    Effort, ImageSource, MessageContent, ProviderResponse, SearchResult, StreamChunk,
    StreamEvent, ToolCallRequest, ToolDefinition, ToolExecutor, ToolInvocation, Usage,
};
