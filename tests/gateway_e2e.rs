//! End-to-end gateway scenarios over the scripted adapter.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use soul_llm::gateway::already_executed_sentinel;
use soul_llm::{
    ChatMessage, ChatOptions, ContentBlock, Gateway, GatewayError, ImageSource, MockAdapter,
    Result, ServiceFactory, StreamChunk, StreamEvent, ToolCallRequest, ToolExecutor, Usage,
    MAX_TOOL_ROUNDS,
};

struct RecordingExecutor {
    calls: Mutex<Vec<(String, Value)>>,
    count: AtomicU32,
}

impl RecordingExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            count: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute(&self, name: &str, input: &Value) -> Result<String> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), input.clone()));
        Ok(format!("executed {}", name))
    }
}

#[tokio::test]
async fn factory_builds_gateway_for_keyless_service() {
    let factory =
        ServiceFactory::new(Arc::new(std::collections::HashMap::<String, String>::new()));
    let gateway = factory.create_gateway("ollama", None).await.unwrap();
    assert_eq!(gateway.adapter().service_id(), "ollama");
    assert!(!gateway.adapter().model().is_empty());

    assert!(matches!(
        factory.create_gateway("anthropic", None).await,
        Err(GatewayError::Config(_))
    ));
}

#[tokio::test]
async fn trivial_prompt_returns_text_and_usage() {
    let mock = Arc::new(MockAdapter::new());
    mock.queue_text("4");
    let result = Gateway::new(mock)
        .chat(&[ChatMessage::user("2+2?")], &ChatOptions::default())
        .await
        .unwrap();
    assert_eq!(result.text, "4");
    assert!(result.usage.input_tokens > 0);
    assert!(result.usage.output_tokens > 0);
}

#[tokio::test]
async fn echo_tool_requested_twice_runs_once() {
    let mock = Arc::new(MockAdapter::new());
    mock.queue_tool_calls(
        "",
        vec![
            ToolCallRequest {
                id: "call_1".into(),
                name: "echo".into(),
                input: json!({"text": "a"}),
            },
            ToolCallRequest {
                id: "call_2".into(),
                name: "echo".into(),
                input: json!({"text": "b"}),
            },
        ],
    );
    mock.queue_text("all done");

    let executor = RecordingExecutor::new();
    let options = ChatOptions {
        tool_executor: Some(executor.clone()),
        ..Default::default()
    };
    let result = Gateway::new(mock)
        .chat(&[ChatMessage::user("echo twice")], &options)
        .await
        .unwrap();

    assert_eq!(executor.count.load(Ordering::SeqCst), 1);
    assert_eq!(result.tool_usage.len(), 2);
    assert_eq!(result.tool_usage[0].result, "executed echo");
    assert_eq!(result.tool_usage[1].result, already_executed_sentinel("echo"));
    assert_eq!(result.text, "all done");
}

#[tokio::test]
async fn tool_loop_always_terminates() {
    let mock = Arc::new(MockAdapter::new());
    mock.set_default_tool_call("spin", json!({}));
    let options = ChatOptions {
        tool_executor: Some(RecordingExecutor::new()),
        ..Default::default()
    };
    let result = Gateway::new(mock.clone())
        .chat(&[ChatMessage::user("never stop")], &options)
        .await
        .unwrap();
    assert!(mock.call_count() <= MAX_TOOL_ROUNDS);
    assert!(!result.tool_usage.is_empty());
}

#[tokio::test]
async fn streaming_replay_matches_non_streaming() {
    let chunks = vec![
        StreamChunk::Thinking("considering ".into()),
        StreamChunk::Thinking("options".into()),
        StreamChunk::Content("The ".into()),
        StreamChunk::Content("answer ".into()),
        StreamChunk::Content("is 4.".into()),
        StreamChunk::Usage(Usage {
            input_tokens: 20,
            output_tokens: 8,
        }),
        StreamChunk::Finished {
            reason: Some("stop".into()),
        },
    ];

    let mock = Arc::new(MockAdapter::new());
    mock.queue_stream(chunks.clone());
    let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let streamed = Gateway::new(mock)
        .stream_chat(
            &[ChatMessage::user("2+2?")],
            &ChatOptions::default(),
            move |ev| sink_events.lock().unwrap().push(ev),
        )
        .await
        .unwrap();

    let mock = Arc::new(MockAdapter::new());
    mock.queue_stream(chunks);
    let plain = Gateway::new(mock)
        .chat(&[ChatMessage::user("2+2?")], &ChatOptions::default())
        .await
        .unwrap();

    assert_eq!(streamed.text, plain.text);
    assert_eq!(streamed.usage, plain.usage);
    assert_eq!(
        streamed.text,
        "<thinking>considering options</thinking>\n\nThe answer is 4."
    );

    let events = events.lock().unwrap();
    let token_text: String = events
        .iter()
        .filter_map(|ev| match ev {
            StreamEvent::Content { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(token_text, "The answer is 4.");
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn streaming_tool_round_emits_lifecycle_events() {
    let mock = Arc::new(MockAdapter::new());
    mock.queue_stream(vec![
        StreamChunk::ToolCallDelta {
            index: 0,
            id: Some("call_1".into()),
            name: Some("lookup".into()),
            arguments: Some("{\"q\":".into()),
        },
        StreamChunk::ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments: Some("\"rust\"}".into()),
        },
        StreamChunk::Finished {
            reason: Some("tool_calls".into()),
        },
    ]);
    mock.queue_text("rust is a language");

    let executor = RecordingExecutor::new();
    let options = ChatOptions {
        tool_executor: Some(executor.clone()),
        ..Default::default()
    };
    let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let result = Gateway::new(mock)
        .stream_chat(&[ChatMessage::user("what is rust")], &options, move |ev| {
            sink_events.lock().unwrap().push(ev)
        })
        .await
        .unwrap();

    // fragments assembled across deltas into one complete call
    assert_eq!(
        executor.calls.lock().unwrap()[0],
        ("lookup".to_string(), json!({"q": "rust"}))
    );
    assert_eq!(result.text, "rust is a language");

    let events = events.lock().unwrap();
    let kinds: Vec<&str> = events
        .iter()
        .map(|ev| match ev {
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::Content { .. } => "content",
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::ToolEnd { .. } => "tool_end",
            StreamEvent::ContentReplace { .. } => "content_replace",
            StreamEvent::Done { .. } => "done",
        })
        .collect();
    assert_eq!(kinds, vec!["tool_start", "tool_end", "content_replace", "done"]);
}

#[tokio::test]
async fn image_to_text_only_adapter_degrades_without_error() {
    let mock = Arc::new(MockAdapter::new());
    // default mock capabilities have no vision
    mock.queue_text("I cannot see images");
    let messages = vec![ChatMessage::user_blocks(vec![
        ContentBlock::Text {
            text: "describe this".into(),
        },
        ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: "image/png".into(),
                data: "aGk=".into(),
            },
        },
    ])];
    let result = Gateway::new(mock.clone())
        .chat(&messages, &ChatOptions::default())
        .await
        .unwrap();
    assert_eq!(result.text, "I cannot see images");

    let sent = mock.last_messages();
    let text = sent[0].content.as_text();
    assert!(text.contains("describe this"));
    assert!(text.contains("1 image unavailable"));
}

#[tokio::test]
async fn thinking_request_on_plain_adapter_proceeds() {
    let mock = Arc::new(MockAdapter::new());
    mock.queue_text("no thinking needed");
    let options = ChatOptions {
        thinking: true,
        thinking_budget: Some(1024),
        ..Default::default()
    };
    let result = Gateway::new(mock.clone())
        .chat(&[ChatMessage::user("hi")], &options)
        .await
        .unwrap();
    assert_eq!(result.text, "no thinking needed");
    assert!(!mock.last_options_thinking());
}

#[tokio::test]
async fn exhausted_retries_surface_http_status() {
    let mock = Arc::new(MockAdapter::new());
    for _ in 0..3 {
        mock.queue_http_error(429, "try later");
    }
    let policy = soul_llm::RetryPolicy {
        max_attempts: 3,
        base_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(5),
    };
    let err = Gateway::new(mock)
        .with_retry_policy(policy)
        .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited { status: 429, .. }));
}

#[tokio::test]
async fn system_fallback_marks_result() {
    let mock = Arc::new(MockAdapter::new());
    mock.queue_http_error(400, "model does not support the system role");
    mock.queue_text("done anyway");
    let options = ChatOptions {
        system_prompt: Some("act helpful".into()),
        ..Default::default()
    };
    let result = Gateway::new(mock)
        .chat(&[ChatMessage::user("hi")], &options)
        .await
        .unwrap();
    assert!(result.system_fallback);
    assert_eq!(result.text, "done anyway");
}
