//! Scripted adapter for tests.
//!
//! Replies are queued ahead of time; each `send`/`send_stream` pops the next
//! script. An exhausted queue falls back to a default reply so loop tests
//! can run an unbounded provider without scripting twenty rounds.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::capabilities::Capabilities;
use crate::error::{GatewayError, Result};
use crate::providers::ChatAdapter;
use crate::sse::ToolCallAssembler;
use crate::types::{
    ChatMessage, ChatOptions, ProviderResponse, StreamChunk, ToolCallRequest, Usage,
};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Plain text answer with nominal usage.
    Text(String),
    /// Full response, as the adapter would have normalized it.
    Response(ProviderResponse),
    /// HTTP error mapped through the usual status taxonomy.
    HttpError { status: u16, body: String },
    /// Raw stream chunks. A non-streaming `send` folds them into a
    /// response, so canned streams can assert replay equivalence.
    Stream(Vec<StreamChunk>),
}

/// Queue-driven test double for [`ChatAdapter`].
pub struct MockAdapter {
    model: String,
    caps: Capabilities,
    scripts: Mutex<VecDeque<ScriptedReply>>,
    default_tool_call: Mutex<Option<(String, Value)>>,
    call_count: AtomicU32,
    last_messages: Mutex<Vec<ChatMessage>>,
    last_thinking: Mutex<bool>,
    last_system_prompt: Mutex<Option<String>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            model: "mock-model".into(),
            caps: Capabilities::default(),
            scripts: Mutex::new(VecDeque::new()),
            default_tool_call: Mutex::new(None),
            call_count: AtomicU32::new(0),
            last_messages: Mutex::new(Vec::new()),
            last_thinking: Mutex::new(false),
            last_system_prompt: Mutex::new(None),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn queue(&self, reply: ScriptedReply) {
        self.scripts.lock().unwrap().push_back(reply);
    }

    pub fn queue_text(&self, text: &str) {
        self.queue(ScriptedReply::Text(text.to_string()));
    }

    pub fn queue_response(&self, response: ProviderResponse) {
        self.queue(ScriptedReply::Response(response));
    }

    pub fn queue_tool_calls(&self, text: &str, calls: Vec<ToolCallRequest>) {
        self.queue(ScriptedReply::Response(ProviderResponse {
            text: text.to_string(),
            tool_calls: calls,
            usage: nominal_usage(),
            stop_reason: Some("tool_use".into()),
            ..Default::default()
        }));
    }

    pub fn queue_http_error(&self, status: u16, body: &str) {
        self.queue(ScriptedReply::HttpError {
            status,
            body: body.to_string(),
        });
    }

    pub fn queue_stream(&self, chunks: Vec<StreamChunk>) {
        self.queue(ScriptedReply::Stream(chunks));
    }

    /// When the queue is exhausted, keep requesting this tool instead of
    /// answering. Exercises the loop ceiling.
    pub fn set_default_tool_call(&self, name: &str, input: Value) {
        *self.default_tool_call.lock().unwrap() = Some((name.to_string(), input));
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Messages from the most recent round trip.
    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages.lock().unwrap().clone()
    }

    /// Whether the most recent round trip had thinking enabled.
    pub fn last_options_thinking(&self) -> bool {
        *self.last_thinking.lock().unwrap()
    }

    /// System prompt from the most recent round trip.
    pub fn last_system_prompt(&self) -> Option<String> {
        self.last_system_prompt.lock().unwrap().clone()
    }

    fn record(&self, messages: &[ChatMessage], options: &ChatOptions) {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();
        *self.last_thinking.lock().unwrap() = options.thinking;
        *self.last_system_prompt.lock().unwrap() = options.system_prompt.clone();
    }

    fn next_script(&self) -> Option<ScriptedReply> {
        self.scripts.lock().unwrap().pop_front()
    }

    fn default_response(&self) -> ProviderResponse {
        match &*self.default_tool_call.lock().unwrap() {
            Some((name, input)) => ProviderResponse {
                tool_calls: vec![ToolCallRequest {
                    id: format!("call_{}", self.call_count()),
                    name: name.clone(),
                    input: input.clone(),
                }],
                usage: nominal_usage(),
                stop_reason: Some("tool_use".into()),
                ..Default::default()
            },
            None => ProviderResponse {
                text: "ok".into(),
                usage: nominal_usage(),
                stop_reason: Some("stop".into()),
                ..Default::default()
            },
        }
    }
}

fn nominal_usage() -> Usage {
    Usage {
        input_tokens: 10,
        output_tokens: 5,
    }
}

/// Fold canned chunks into the response a full stream would produce.
fn fold_chunks(chunks: Vec<StreamChunk>) -> ProviderResponse {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut assembler = ToolCallAssembler::new();
    let mut usage = Usage::default();
    let mut stop_reason = None;
    for chunk in chunks {
        match chunk {
            StreamChunk::Content(delta) => text.push_str(&delta),
            StreamChunk::Thinking(delta) => thinking.push_str(&delta),
            StreamChunk::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => assembler.push(index, id, name, arguments),
            StreamChunk::Usage(u) => usage = u,
            StreamChunk::Finished { reason } => stop_reason = reason,
        }
    }
    ProviderResponse {
        text,
        thinking: if thinking.is_empty() {
            None
        } else {
            Some(thinking)
        },
        tool_calls: assembler.finish(),
        usage,
        citations: Vec::new(),
        stop_reason,
    }
}

/// Expand a response into the chunk sequence a stream would have carried.
fn response_to_chunks(response: ProviderResponse) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    if let Some(thinking) = response.thinking {
        chunks.push(StreamChunk::Thinking(thinking));
    }
    if !response.text.is_empty() {
        chunks.push(StreamChunk::Content(response.text));
    }
    for (index, call) in response.tool_calls.into_iter().enumerate() {
        chunks.push(StreamChunk::ToolCallDelta {
            index,
            id: Some(call.id),
            name: Some(call.name),
            arguments: Some(call.input.to_string()),
        });
    }
    chunks.push(StreamChunk::Usage(response.usage));
    chunks.push(StreamChunk::Finished {
        reason: response.stop_reason,
    });
    chunks
}

#[async_trait]
impl ChatAdapter for MockAdapter {
    fn service_id(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ProviderResponse> {
        self.record(messages, options);
        match self.next_script() {
            Some(ScriptedReply::Text(text)) => Ok(ProviderResponse {
                text,
                usage: nominal_usage(),
                stop_reason: Some("stop".into()),
                ..Default::default()
            }),
            Some(ScriptedReply::Response(response)) => Ok(response),
            Some(ScriptedReply::HttpError { status, body }) => {
                Err(GatewayError::from_status(status, body, None))
            }
            Some(ScriptedReply::Stream(chunks)) => Ok(fold_chunks(chunks)),
            None => Ok(self.default_response()),
        }
    }

    async fn send_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        self.record(messages, options);
        let chunks = match self.next_script() {
            Some(ScriptedReply::Stream(chunks)) => chunks,
            Some(ScriptedReply::Text(text)) => vec![
                StreamChunk::Content(text),
                StreamChunk::Usage(nominal_usage()),
                StreamChunk::Finished {
                    reason: Some("stop".into()),
                },
            ],
            Some(ScriptedReply::Response(response)) => response_to_chunks(response),
            Some(ScriptedReply::HttpError { status, body }) => {
                return Err(GatewayError::from_status(status, body, None))
            }
            None => response_to_chunks(self.default_response()),
        };
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}
