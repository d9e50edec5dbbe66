//! Provider adapters.
//!
//! Each adapter translates the crate's normalized messages into one vendor
//! wire format and back. Adapters are stateless apart from their HTTP client
//! and configuration; the tool loop, retries, and capability negotiation all
//! live above them in [`crate::gateway`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::capabilities::Capabilities;
use crate::error::{GatewayError, Result};
use crate::types::{ChatMessage, ChatOptions, ProviderResponse, StreamChunk};

pub mod anthropic;
pub use anthropic::AnthropicAdapter;

pub mod openai;
pub use openai::OpenAiAdapter;

pub mod openai_compat;
pub use openai_compat::{CompatProfile, OpenAiCompatAdapter};

pub mod gemini;
pub use gemini::GeminiAdapter;

pub mod mock;
pub use mock::{MockAdapter, ScriptedReply};

/// One vendor chat API, normalized.
///
/// `send` performs exactly one round trip; the gateway drives the tool loop
/// by calling it repeatedly. Implementations must not retry internally.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Stable service identifier ("anthropic", "openai", ...).
    fn service_id(&self) -> &str;

    /// Model this adapter instance targets.
    fn model(&self) -> &str;

    /// What this provider/model combination supports.
    fn capabilities(&self) -> Capabilities;

    /// One non-streaming round trip with already-negotiated options.
    async fn send(&self, messages: &[ChatMessage], options: &ChatOptions)
        -> Result<ProviderResponse>;

    /// One streaming round trip. The default refuses; adapters with SSE
    /// support override it.
    async fn send_stream(
        &self,
        _messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        Err(GatewayError::NotSupported(format!(
            "streaming is not implemented for provider '{}'",
            self.service_id()
        )))
    }
}
