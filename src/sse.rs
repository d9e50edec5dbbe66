//! SSE decoding primitives shared by the provider adapters.
//!
//! [`LineBuffer`] is a push-bytes/pull-lines state machine: network chunks go
//! in at arbitrary boundaries, complete lines come out. Adapters layer their
//! vendor event parsing on top of it, so the framing logic is unit-testable
//! without a socket.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::Result;
use crate::types::{StreamChunk, ToolCallRequest, Usage};

/// Accumulates raw bytes and yields complete lines.
///
/// The trailing partial line is held across pushes, so output is identical
/// no matter how the byte stream is chunked.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of bytes. Invalid UTF-8 is replaced, not fatal.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Pop the next complete line, without its terminator. `\r\n` and `\n`
    /// are both accepted.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.find('\n')?;
        let mut line: String = self.buf.drain(..=pos).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// Whatever is left after the stream ends (usually empty).
    pub fn remainder(&self) -> &str {
        &self.buf
    }
}

/// Strip SSE `data:` framing. Returns the payload, or `None` for comments,
/// blank keep-alive lines, `event:` lines, and the `[DONE]` sentinel.
pub fn sse_data(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        None
    } else {
        Some(payload)
    }
}

// OpenAI chat/completions stream frame. The same shape is used by every
// OpenAI-compatible vendor this crate talks to.
#[derive(Debug, Deserialize)]
struct CompletionFrame {
    #[serde(default)]
    choices: Vec<FrameChoice>,
    #[serde(default)]
    usage: Option<FrameUsage>,
}

#[derive(Debug, Deserialize)]
struct FrameChoice {
    #[serde(default)]
    delta: FrameDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FrameDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<FrameToolCall>>,
}

#[derive(Debug, Deserialize)]
struct FrameToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FrameFunction>,
}

#[derive(Debug, Deserialize)]
struct FrameFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Decode one OpenAI-style SSE line into stream chunks.
///
/// Malformed JSON is logged and skipped; a bad frame never kills the stream.
pub fn decode_openai_line(line: &str) -> Vec<StreamChunk> {
    let Some(payload) = sse_data(line) else {
        return Vec::new();
    };
    let frame: CompletionFrame = match serde_json::from_str(payload) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "skipping malformed stream frame");
            return Vec::new();
        }
    };

    let mut chunks = Vec::new();
    for choice in frame.choices {
        if let Some(text) = choice.delta.reasoning_content {
            if !text.is_empty() {
                chunks.push(StreamChunk::Thinking(text));
            }
        }
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                chunks.push(StreamChunk::Content(text));
            }
        }
        if let Some(tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                chunks.push(StreamChunk::ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name,
                    arguments,
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            chunks.push(StreamChunk::Finished {
                reason: Some(reason),
            });
        }
    }
    if let Some(u) = frame.usage {
        chunks.push(StreamChunk::Usage(Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }));
    }
    chunks
}

/// Turn an SSE response body into a chunk stream.
///
/// `decode` maps one complete line to zero or more chunks; it owns whatever
/// per-stream state the vendor format needs. Transport errors surface as
/// stream items so the consumer sees them in order.
pub fn sse_chunk_stream(
    response: reqwest::Response,
    mut decode: impl FnMut(&str) -> Vec<Result<StreamChunk>> + Send + 'static,
) -> BoxStream<'static, Result<StreamChunk>> {
    response
        .bytes_stream()
        .scan(LineBuffer::new(), move |buf, item| {
            let out: Vec<Result<StreamChunk>> = match item {
                Ok(bytes) => {
                    buf.push(&bytes);
                    let mut chunks = Vec::new();
                    while let Some(line) = buf.next_line() {
                        chunks.extend(decode(&line));
                    }
                    chunks
                }
                Err(e) => vec![Err(crate::error::GatewayError::from(e))],
            };
            futures::future::ready(Some(out))
        })
        .flat_map(stream::iter)
        .boxed()
}

#[derive(Debug, Default)]
struct Fragment {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Assembles [`StreamChunk::ToolCallDelta`] fragments, keyed by index, into
/// complete tool calls. Lives only for the duration of one stream.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    fragments: BTreeMap<usize, Fragment>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, id: Option<String>, name: Option<String>, arguments: Option<String>) {
        let frag = self.fragments.entry(index).or_default();
        if let Some(id) = id {
            frag.id = Some(id);
        }
        if let Some(name) = name {
            frag.name = Some(name);
        }
        if let Some(args) = arguments {
            frag.arguments.push_str(&args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Finish the stream: fragments become complete tool calls, in index
    /// order. Fragments without a name are logged and dropped; empty
    /// argument buffers become `{}`.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        let mut calls = Vec::new();
        for (index, frag) in self.fragments {
            let Some(name) = frag.name else {
                warn!(index, "discarding tool call fragment with no name");
                continue;
            };
            let input: Value = if frag.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&frag.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(index, name = %name, error = %e, "tool call arguments are not valid JSON");
                        Value::Object(Default::default())
                    }
                }
            };
            calls.push(ToolCallRequest {
                id: frag.id.unwrap_or_else(|| format!("call_{}", index)),
                name,
                input,
            });
        }
        calls
    }
}
