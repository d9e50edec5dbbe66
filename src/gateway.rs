//! The gateway: capability negotiation, retries, the bounded tool loop, and
//! final result assembly over a single provider adapter.
//!
//! `chat` and `stream_chat` share one driver. In streaming mode only the
//! first round trip streams; once the model requests tools, the remaining
//! rounds are plain requests and the revised answer reaches the caller as a
//! `ContentReplace` event.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::capabilities::negotiate;
use crate::error::{GatewayError, Result};
use crate::normalize::{prepare_messages, system_prompt_to_user_message};
use crate::providers::ChatAdapter;
use crate::retry::RetryPolicy;
use crate::sse::ToolCallAssembler;
use crate::types::{
    ChatMessage, ChatOptions, ChatResult, ContentBlock, ProviderResponse, StreamChunk,
    StreamEvent, ToolInvocation, Usage,
};

/// Ceiling on round trips per call. Guarantees termination even when a
/// provider keeps requesting the same tool.
pub const MAX_TOOL_ROUNDS: u32 = 20;

type Sink<'a> = &'a (dyn Fn(StreamEvent) + Send + Sync);

/// Result text recorded for a tool call whose name already ran this turn.
pub fn already_executed_sentinel(name: &str) -> String {
    format!("Tool '{}' was already executed in this turn.", name)
}

/// One provider adapter plus the policy that drives it.
pub struct Gateway {
    adapter: Arc<dyn ChatAdapter>,
    retry: RetryPolicy,
}

impl Gateway {
    /// Wrap an adapter. The retry policy follows the provider's rate-limit
    /// profile unless overridden.
    pub fn new(adapter: Arc<dyn ChatAdapter>) -> Self {
        let retry = if adapter.capabilities().aggressive_rate_limits {
            RetryPolicy::aggressive_rate_limits()
        } else {
            RetryPolicy::default()
        };
        Self { adapter, retry }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn ChatAdapter> {
        &self.adapter
    }

    /// Send a conversation and drive the tool loop to completion.
    #[instrument(skip_all, fields(service = self.adapter.service_id(), model = self.adapter.model()))]
    pub async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResult> {
        self.drive(messages, options, None).await
    }

    /// Like [`Gateway::chat`], emitting [`StreamEvent`]s as tokens arrive.
    ///
    /// Always ends with a `Done` event carrying the final result. Dropping
    /// the returned future aborts the in-flight request and the loop.
    #[instrument(skip_all, fields(service = self.adapter.service_id(), model = self.adapter.model()))]
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        on_event: impl Fn(StreamEvent) + Send + Sync,
    ) -> Result<ChatResult> {
        self.drive(messages, options, Some(&on_event)).await
    }

    async fn drive(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        sink: Option<Sink<'_>>,
    ) -> Result<ChatResult> {
        let caps = self.adapter.capabilities();
        let (mut effective, _dropped) = negotiate(options, &caps);
        let mut transcript = prepare_messages(messages, &mut effective, &caps);

        let mut system_fallback = false;
        if !caps.system_role {
            if let Some(sys) = effective.system_prompt.take() {
                transcript = system_prompt_to_user_message(&transcript, &sys);
            }
        }

        let executor = effective.tool_executor.clone();
        let mut usage = Usage::default();
        let mut citations = Vec::new();
        let mut tool_usage: Vec<ToolInvocation> = Vec::new();
        let mut executed: HashSet<String> = HashSet::new();
        let mut thinking_parts: Vec<String> = Vec::new();
        let mut final_text;
        let mut streamed_any = false;
        let mut tool_rounds = false;
        let mut round = 0u32;

        loop {
            round += 1;
            let was_streamed = sink.is_some() && caps.streaming && round == 1;
            let response = match (sink, was_streamed) {
                (Some(sink), true) => {
                    streamed_any = true;
                    self.stream_round(&mut transcript, &mut effective, &mut system_fallback, sink)
                        .await?
                }
                _ => {
                    self.send_round(&mut transcript, &mut effective, &mut system_fallback)
                        .await?
                }
            };

            usage.add(response.usage);
            citations.extend(response.citations);
            if let Some(thinking) = &response.thinking {
                if !thinking.is_empty() {
                    if let (Some(sink), false) = (sink, was_streamed) {
                        sink(StreamEvent::Thinking {
                            text: thinking.clone(),
                        });
                    }
                    thinking_parts.push(thinking.clone());
                }
            }
            final_text = response.text.clone();

            if response.tool_calls.is_empty() {
                break;
            }
            let Some(executor) = executor.as_ref() else {
                warn!("model requested tools but no tool executor is configured");
                break;
            };
            if round >= MAX_TOOL_ROUNDS {
                warn!(rounds = round, "tool round ceiling reached, stopping loop");
                break;
            }
            tool_rounds = true;

            let mut blocks = Vec::new();
            if !response.text.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: response.text.clone(),
                });
            }
            for call in &response.tool_calls {
                blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });
            }
            transcript.push(ChatMessage::assistant_blocks(blocks));

            for call in response.tool_calls {
                let result_text = if !executed.insert(call.name.clone()) {
                    debug!(name = %call.name, "duplicate tool call, returning sentinel");
                    already_executed_sentinel(&call.name)
                } else {
                    if let Some(sink) = sink {
                        sink(StreamEvent::ToolStart {
                            name: call.name.clone(),
                        });
                    }
                    let outcome = match executor.execute(&call.name, &call.input).await {
                        Ok(text) => text,
                        Err(e @ GatewayError::ToolExecution { .. }) => return Err(e),
                        Err(e) => {
                            return Err(GatewayError::ToolExecution {
                                name: call.name.clone(),
                                message: e.to_string(),
                            })
                        }
                    };
                    if let Some(sink) = sink {
                        sink(StreamEvent::ToolEnd {
                            name: call.name.clone(),
                        });
                    }
                    outcome
                };
                tool_usage.push(ToolInvocation {
                    name: call.name.clone(),
                    input: call.input.clone(),
                    result: result_text.clone(),
                });
                transcript.push(ChatMessage::tool_result(&call.id, result_text));
            }
        }

        let visible = match &effective.prefill {
            Some(prefill) => format!("{}{}", prefill, final_text),
            None => final_text,
        };
        let thinking_joined = thinking_parts.join("\n");
        let text = if thinking_joined.is_empty() {
            visible.clone()
        } else {
            format!("<thinking>{}</thinking>\n\n{}", thinking_joined, visible)
        };

        let result = ChatResult {
            text,
            usage,
            citations,
            tool_usage,
            system_fallback,
        };

        if let Some(sink) = sink {
            if !streamed_any {
                sink(StreamEvent::Content {
                    text: visible.clone(),
                });
            } else if tool_rounds {
                sink(StreamEvent::ContentReplace {
                    text: visible.clone(),
                });
            }
            sink(StreamEvent::Done {
                result: result.clone(),
            });
        }
        Ok(result)
    }

    /// One non-streaming round trip, with the retry policy and the one-shot
    /// system-role fallback.
    async fn send_round(
        &self,
        transcript: &mut Vec<ChatMessage>,
        effective: &mut ChatOptions,
        system_fallback: &mut bool,
    ) -> Result<ProviderResponse> {
        let first = {
            let t: &[ChatMessage] = transcript;
            let o: &ChatOptions = effective;
            self.retry.execute(|| self.adapter.send(t, o)).await
        };
        match first {
            Ok(response) => Ok(response),
            Err(e) if e.is_system_role_rejection() && !*system_fallback => {
                match effective.system_prompt.take() {
                    Some(sys) => {
                        warn!("provider rejected system role, retrying with user-message fallback");
                        *transcript = system_prompt_to_user_message(transcript, &sys);
                        *system_fallback = true;
                        let t: &[ChatMessage] = transcript;
                        let o: &ChatOptions = effective;
                        self.retry.execute(|| self.adapter.send(t, o)).await
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// One streaming round trip: open the stream (with retry and the
    /// system-role fallback), forward deltas to the sink, and fold the
    /// chunks into a normalized response.
    async fn stream_round(
        &self,
        transcript: &mut Vec<ChatMessage>,
        effective: &mut ChatOptions,
        system_fallback: &mut bool,
        sink: Sink<'_>,
    ) -> Result<ProviderResponse> {
        let opened = {
            let t: &[ChatMessage] = transcript;
            let o: &ChatOptions = effective;
            self.retry.execute(|| self.adapter.send_stream(t, o)).await
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) if e.is_system_role_rejection() && !*system_fallback => {
                match effective.system_prompt.take() {
                    Some(sys) => {
                        warn!("provider rejected system role, retrying with user-message fallback");
                        *transcript = system_prompt_to_user_message(transcript, &sys);
                        *system_fallback = true;
                        let t: &[ChatMessage] = transcript;
                        let o: &ChatOptions = effective;
                        self.retry.execute(|| self.adapter.send_stream(t, o)).await?
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let mut text = String::new();
        let mut thinking = String::new();
        let mut assembler = ToolCallAssembler::new();
        let mut usage = Usage::default();
        let mut stop_reason = None;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Content(delta) => {
                    sink(StreamEvent::Content {
                        text: delta.clone(),
                    });
                    text.push_str(&delta);
                }
                StreamChunk::Thinking(delta) => {
                    sink(StreamEvent::Thinking {
                        text: delta.clone(),
                    });
                    thinking.push_str(&delta);
                }
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

        Ok(ProviderResponse {
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
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::providers::MockAdapter;
    use crate::types::{ToolCallRequest, ToolExecutor};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct CountingExecutor {
        calls: AtomicU32,
        reply: String,
    }

    impl CountingExecutor {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                reply: reply.to_string(),
            })
        }
    }

    #[async_trait]
    impl ToolExecutor for CountingExecutor {
        async fn execute(&self, _name: &str, _input: &Value) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl ToolExecutor for FailingExecutor {
        async fn execute(&self, _name: &str, _input: &Value) -> Result<String> {
            Err(GatewayError::Config("index offline".into()))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_trivial_chat() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_text("4");
        let gateway = Gateway::new(mock);
        let result = gateway
            .chat(&[ChatMessage::user("2+2?")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "4");
        assert!(result.usage.input_tokens > 0);
        assert!(result.usage.output_tokens > 0);
        assert!(!result.system_fallback);
        assert!(result.tool_usage.is_empty());
    }

    #[tokio::test]
    async fn test_tool_loop_runs_and_sums_usage() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "echo".into(),
                input: json!({"v": 1}),
            }],
        );
        mock.queue_text("echoed");
        let executor = CountingExecutor::new("1");
        let options = ChatOptions {
            tool_executor: Some(executor.clone()),
            ..Default::default()
        };
        let gateway = Gateway::new(mock.clone());
        let result = gateway
            .chat(&[ChatMessage::user("run echo")], &options)
            .await
            .unwrap();

        assert_eq!(result.text, "echoed");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.tool_usage.len(), 1);
        assert_eq!(result.tool_usage[0].name, "echo");
        assert_eq!(result.tool_usage[0].result, "1");
        assert_eq!(mock.call_count(), 2);
        // usage summed across both rounds
        assert_eq!(result.usage.input_tokens, 20);
        assert_eq!(result.usage.output_tokens, 10);
    }

    #[tokio::test]
    async fn test_duplicate_tool_name_gets_sentinel() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_tool_calls(
            "",
            vec![
                ToolCallRequest {
                    id: "call_1".into(),
                    name: "echo".into(),
                    input: json!({"v": 1}),
                },
                ToolCallRequest {
                    id: "call_2".into(),
                    name: "echo".into(),
                    input: json!({"v": 2}),
                },
            ],
        );
        mock.queue_text("done");
        let executor = CountingExecutor::new("first");
        let options = ChatOptions {
            tool_executor: Some(executor.clone()),
            ..Default::default()
        };
        let result = Gateway::new(mock)
            .chat(&[ChatMessage::user("go")], &options)
            .await
            .unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.tool_usage.len(), 2);
        assert_eq!(result.tool_usage[0].result, "first");
        assert_eq!(result.tool_usage[1].result, already_executed_sentinel("echo"));
        assert_eq!(result.text, "done");
    }

    #[tokio::test]
    async fn test_tool_loop_terminates_at_ceiling() {
        let mock = Arc::new(MockAdapter::new());
        // queue nothing: the default reply always requests the same tool
        mock.set_default_tool_call("loop_forever", json!({}));
        let executor = CountingExecutor::new("again");
        let options = ChatOptions {
            tool_executor: Some(executor),
            ..Default::default()
        };
        let result = Gateway::new(mock.clone())
            .chat(&[ChatMessage::user("go")], &options)
            .await
            .unwrap();
        assert!(mock.call_count() <= MAX_TOOL_ROUNDS);
        // one real execution, the rest sentinels
        let sentinels = result
            .tool_usage
            .iter()
            .filter(|t| t.result == already_executed_sentinel("loop_forever"))
            .count();
        assert_eq!(result.tool_usage.len() - sentinels, 1);
    }

    #[tokio::test]
    async fn test_executor_error_propagates_as_tool_execution() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "search".into(),
                input: json!({}),
            }],
        );
        let options = ChatOptions {
            tool_executor: Some(Arc::new(FailingExecutor)),
            ..Default::default()
        };
        let err = Gateway::new(mock)
            .chat(&[ChatMessage::user("go")], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolExecution { ref name, .. } if name == "search"));
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_surfaced() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_http_error(429, "rate limited");
        mock.queue_http_error(429, "rate limited");
        mock.queue_http_error(429, "rate limited");
        let err = Gateway::new(mock.clone())
            .with_retry_policy(fast_retry())
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_recovers_within_budget() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_http_error(429, "rate limited");
        mock.queue_text("recovered");
        let result = Gateway::new(mock)
            .with_retry_policy(fast_retry())
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "recovered");
    }

    #[tokio::test]
    async fn test_system_role_rejection_falls_back_once() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_http_error(400, "'system' is not a supported role");
        mock.queue_text("hello");
        let options = ChatOptions {
            system_prompt: Some("be brief".into()),
            ..Default::default()
        };
        let result = Gateway::new(mock.clone())
            .chat(&[ChatMessage::user("hi")], &options)
            .await
            .unwrap();
        assert!(result.system_fallback);
        assert_eq!(result.text, "hello");
        // retry carried the rewritten transcript
        let sent = mock.last_messages();
        assert_eq!(
            sent[0].content.as_text(),
            "[System Instructions]\nbe brief"
        );
    }

    #[tokio::test]
    async fn test_thinking_surfaced_in_delimited_block() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_response(ProviderResponse {
            text: "the answer".into(),
            thinking: Some("let me think".into()),
            ..Default::default()
        });
        let result = Gateway::new(mock)
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(
            result.text,
            "<thinking>let me think</thinking>\n\nthe answer"
        );
    }

    #[tokio::test]
    async fn test_prefill_prepended() {
        let mock = Arc::new(MockAdapter::new().with_capabilities(Capabilities {
            prefill: true,
            ..Capabilities::default()
        }));
        mock.queue_text("\"value\": 1}");
        let options = ChatOptions {
            prefill: Some("{".into()),
            ..Default::default()
        };
        let result = Gateway::new(mock)
            .chat(&[ChatMessage::user("emit json")], &options)
            .await
            .unwrap();
        assert_eq!(result.text, "{\"value\": 1}");
    }

    #[tokio::test]
    async fn test_stream_chat_events_and_replay_equivalence() {
        // Streamed deltas and the equivalent non-streaming transcript must
        // produce identical final text and usage.
        let chunks = vec![
            StreamChunk::Thinking("hmm ".into()),
            StreamChunk::Content("Hel".into()),
            StreamChunk::Content("lo".into()),
            StreamChunk::Usage(Usage {
                input_tokens: 12,
                output_tokens: 3,
            }),
            StreamChunk::Finished {
                reason: Some("stop".into()),
            },
        ];

        let mock = Arc::new(MockAdapter::new());
        mock.queue_stream(chunks.clone());
        let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let streamed = Gateway::new(mock)
            .stream_chat(
                &[ChatMessage::user("hi")],
                &ChatOptions::default(),
                move |ev| events_clone.lock().unwrap().push(ev),
            )
            .await
            .unwrap();

        let mock = Arc::new(MockAdapter::new());
        mock.queue_stream(chunks);
        let plain = Gateway::new(mock)
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(streamed.text, plain.text);
        assert_eq!(streamed.usage, plain.usage);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], StreamEvent::Thinking { .. }));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { .. })
        ));
        let content: String = events
            .iter()
            .filter_map(|ev| match ev {
                StreamEvent::Content { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(content, "Hello");
    }

    #[tokio::test]
    async fn test_stream_chat_tool_loop_emits_replace() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_stream(vec![
            StreamChunk::ToolCallDelta {
                index: 0,
                id: Some("call_1".into()),
                name: Some("echo".into()),
                arguments: Some("{\"v\":1}".into()),
            },
            StreamChunk::Finished {
                reason: Some("tool_calls".into()),
            },
        ]);
        mock.queue_text("final answer");
        let executor = CountingExecutor::new("1");
        let options = ChatOptions {
            tool_executor: Some(executor),
            ..Default::default()
        };
        let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let result = Gateway::new(mock)
            .stream_chat(&[ChatMessage::user("go")], &options, move |ev| {
                events_clone.lock().unwrap().push(ev)
            })
            .await
            .unwrap();

        assert_eq!(result.text, "final answer");
        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|ev| matches!(ev, StreamEvent::ToolStart { name } if name == "echo")));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, StreamEvent::ToolEnd { name } if name == "echo")));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, StreamEvent::ContentReplace { text } if text == "final answer")));
    }

    #[tokio::test]
    async fn test_thinking_on_unsupported_adapter_proceeds() {
        let mock = Arc::new(MockAdapter::new());
        // mock default capabilities do not include thinking
        mock.queue_text("plain answer");
        let options = ChatOptions {
            thinking: true,
            thinking_budget: Some(2048),
            ..Default::default()
        };
        let result = Gateway::new(mock.clone())
            .chat(&[ChatMessage::user("hi")], &options)
            .await
            .unwrap();
        assert_eq!(result.text, "plain answer");
        assert!(!mock.last_options_thinking());
    }

    #[tokio::test]
    async fn test_system_message_content_reaches_wire() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_text("ok");
        Gateway::new(mock.clone())
            .chat(
                &[ChatMessage::system("be terse"), ChatMessage::user("hi")],
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        // folded into the system prompt, not silently discarded
        assert_eq!(mock.last_system_prompt().as_deref(), Some("be terse"));
        assert_eq!(mock.last_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_messages_never_sent() {
        let mock = Arc::new(MockAdapter::new());
        mock.queue_text("ok");
        Gateway::new(mock.clone())
            .chat(
                &[
                    ChatMessage::user("hello"),
                    ChatMessage::assistant(""),
                    ChatMessage::user("   "),
                ],
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(mock.last_messages().len(), 1);
    }
}
