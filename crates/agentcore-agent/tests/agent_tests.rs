//! End-to-end scenarios driving a real `AgentRuntime` against a scripted
//! provider: happy-path text, a status tag split across chunks, parallel
//! tool calls preserved by identifier, orphan repair across turns, a
//! transient failure that retries into success, and a permanent failure
//! that does not.

use agentcore_agent::{AgentConfig, AgentEvent, AgentRuntime, EventEmitter};
use agentcore_provider::types::{
    LlmMessage, LlmTool, PartialToolCall, ToolCallIdentity, Usage,
};
use agentcore_provider::{LlmError, LlmProvider, LlmRequest, LlmResult, ProviderStream, StreamEvent};
use agentcore_tools::mock_registry;
use agentcore_types::{Message, SessionKey, ToolDefinition};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// A provider whose turns are scripted in advance. Each call to `stream`
/// consumes the next turn in the script; a turn that's an `Err` is returned
/// directly rather than as a stream.
struct ScriptedProvider {
    script: Mutex<Vec<LlmResult<Vec<StreamEvent>>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(turns: Vec<LlmResult<Vec<StreamEvent>>>) -> Self {
        Self {
            script: Mutex::new(turns),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }
    fn models(&self) -> &[&str] {
        &["scripted-model"]
    }

    async fn stream(&self, _request: LlmRequest) -> LlmResult<ProviderStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().expect("lock poisoned");
        let turn = if script.is_empty() {
            Ok(Vec::new())
        } else {
            script.remove(0)
        };
        let events = turn?;
        let stream = futures::stream::iter(events.into_iter().map(Ok));
        Ok(ProviderStream::Native {
            events: Box::pin(stream),
            cancel: CancellationToken::new(),
        })
    }

    fn parse_stream_event(&self, _json: &str) -> Vec<StreamEvent> {
        Vec::new()
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<LlmMessage> {
        messages
            .iter()
            .map(|m| LlmMessage {
                role: format!("{:?}", m.role).to_lowercase(),
                content: m.content.clone().into(),
            })
            .collect()
    }

    fn convert_tools(&self, tools: &[ToolDefinition]) -> Vec<LlmTool> {
        tools
            .iter()
            .map(|t| LlmTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }
}

fn usage(input: u64, output: u64) -> Option<Usage> {
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
    })
}

async fn drain_until<F>(rx: &mut broadcast::Receiver<AgentEvent>, mut is_terminal: F) -> Vec<AgentEvent>
where
    F: FnMut(&AgentEvent) -> bool,
{
    let mut seen = Vec::new();
    for _ in 0..200 {
        match tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await {
            Ok(Ok(event)) => {
                let done = is_terminal(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
            _ => break,
        }
    }
    seen
}

#[tokio::test]
async fn happy_path_text_response() {
    let provider = Arc::new(ScriptedProvider::new(vec![Ok(vec![
        StreamEvent::TextStart,
        StreamEvent::TextDelta("Hello, world!".to_string()),
        StreamEvent::ResponseDone {
            usage: usage(20, 5),
        },
    ])]));
    let tools = Arc::new(mock_registry());
    let emitter = Arc::new(EventEmitter::new(true));
    let session_id = SessionKey::new("happy");
    let mut rx = emitter.subscribe(&session_id);

    let (runtime, handle) = AgentRuntime::new(
        session_id,
        AgentConfig::default(),
        "/tmp".into(),
        provider,
        tools,
        None,
        emitter,
    );
    let task = tokio::spawn(runtime.run());
    handle.prompt("hi").await;

    let events = drain_until(&mut rx, |e| matches!(e, AgentEvent::AgentEnd { .. })).await;
    assert!(events.iter().any(|e| matches!(e, AgentEvent::AgentStart)));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::MessageDelta { delta } if delta == "Hello, world!")));
    let end = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::AgentEnd { messages, .. } => Some(messages),
            _ => None,
        })
        .expect("agent_end event");
    assert_eq!(end.last().unwrap().content, "Hello, world!");

    drop(handle);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
}

#[tokio::test]
async fn status_tag_spanning_chunks_fires_exactly_once() {
    let provider = Arc::new(ScriptedProvider::new(vec![Ok(vec![
        StreamEvent::TextStart,
        StreamEvent::TextDelta("Hello<sta".to_string()),
        StreamEvent::TextDelta("tus>Reading files</status>world".to_string()),
        StreamEvent::ResponseDone {
            usage: usage(10, 5),
        },
    ])]));
    let tools = Arc::new(mock_registry());
    let emitter = Arc::new(EventEmitter::new(true));
    let session_id = SessionKey::new("status");
    let mut rx = emitter.subscribe(&session_id);

    let (runtime, handle) = AgentRuntime::new(
        session_id,
        AgentConfig::default(),
        "/tmp".into(),
        provider,
        tools,
        None,
        emitter,
    );
    let task = tokio::spawn(runtime.run());
    handle.prompt("go").await;

    let events = drain_until(&mut rx, |e| matches!(e, AgentEvent::AgentEnd { .. })).await;
    let status_updates: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::StatusUpdate { text } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(status_updates, vec!["Reading files"]);

    let deltas: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::MessageDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, "Helloworld");

    drop(handle);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
}

fn tool_start(call_id: &str, index: i64, name: &str) -> StreamEvent {
    StreamEvent::ToolCallStart(PartialToolCall {
        identity: ToolCallIdentity {
            call_id: Some(call_id.to_string()),
            item_id: None,
            call_index: Some(index),
        },
        name: Some(name.to_string()),
        arguments_json: String::new(),
        arguments: None,
    })
}

fn tool_delta(call_id: &str, delta: &str) -> StreamEvent {
    StreamEvent::ToolCallDelta {
        identity: ToolCallIdentity {
            call_id: Some(call_id.to_string()),
            item_id: None,
            call_index: None,
        },
        delta: delta.to_string(),
    }
}

fn tool_done(call_id: &str) -> StreamEvent {
    StreamEvent::ToolCallDone(PartialToolCall {
        identity: ToolCallIdentity {
            call_id: Some(call_id.to_string()),
            item_id: None,
            call_index: None,
        },
        name: None,
        arguments_json: String::new(),
        arguments: None,
    })
}

#[tokio::test]
async fn parallel_tool_calls_preserved_by_identifier_not_position() {
    let turn_one = vec![
        tool_start("call_a", 0, "echo"),
        tool_start("call_b", 1, "echo"),
        tool_delta("call_a", r#"{"text":"A"#),
        tool_delta("call_b", r#"{"text":"B"#),
        tool_delta("call_a", r#"A"}"#),
        tool_delta("call_b", r#"B"}"#),
        tool_done("call_a"),
        tool_done("call_b"),
        StreamEvent::ResponseDone { usage: None },
    ];
    let turn_two = vec![
        StreamEvent::TextStart,
        StreamEvent::TextDelta("done".to_string()),
        StreamEvent::ResponseDone { usage: None },
    ];

    let provider = Arc::new(ScriptedProvider::new(vec![Ok(turn_one), Ok(turn_two)]));
    let tools = Arc::new(mock_registry());
    let emitter = Arc::new(EventEmitter::new(true));
    let session_id = SessionKey::new("parallel");
    let mut rx = emitter.subscribe(&session_id);

    let (runtime, handle) = AgentRuntime::new(
        session_id,
        AgentConfig::default(),
        "/tmp".into(),
        provider,
        tools,
        None,
        emitter,
    );
    let task = tokio::spawn(runtime.run());
    handle.prompt("run both").await;

    let events = drain_until(&mut rx, |e| matches!(e, AgentEvent::AgentEnd { .. })).await;

    let starts: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolExecutionStart { call_id, .. } => Some(call_id),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), 2);
    assert!(starts.contains(&&"call_a".to_string()));
    assert!(starts.contains(&&"call_b".to_string()));

    let ends: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolExecutionEnd { is_error, .. } => Some(*is_error),
            _ => None,
        })
        .collect();
    assert_eq!(ends.len(), 2);
    assert!(ends.iter().all(|err| !err));

    drop(handle);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
}

#[tokio::test]
async fn aborted_turn_is_repaired_and_next_prompt_still_completes() {
    let dangling = vec![
        tool_start("call_x", 0, "echo"),
        tool_delta("call_x", r#"{"text":"hi"}"#),
        tool_done("call_x"),
        // No ResponseDone: simulates a connection cut mid-turn.
    ];
    let next_turn = vec![
        StreamEvent::TextStart,
        StreamEvent::TextDelta("recovered".to_string()),
        StreamEvent::ResponseDone { usage: None },
    ];

    let provider = Arc::new(ScriptedProvider::new(vec![Ok(dangling), Ok(next_turn)]));
    let tools = Arc::new(mock_registry());
    let emitter = Arc::new(EventEmitter::new(true));
    let session_id = SessionKey::new("orphan");
    let mut rx = emitter.subscribe(&session_id);

    let (runtime, handle) = AgentRuntime::new(
        session_id,
        AgentConfig::default(),
        "/tmp".into(),
        provider,
        tools,
        None,
        emitter,
    );
    let task = tokio::spawn(runtime.run());
    handle.prompt("start a tool call then vanish").await;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    handle.abort();

    let abort_events = drain_until(&mut rx, |e| matches!(e, AgentEvent::AgentAbort)).await;
    assert!(abort_events
        .iter()
        .any(|e| matches!(e, AgentEvent::AgentAbort)));

    handle.prompt("continue").await;
    let events = drain_until(&mut rx, |e| matches!(e, AgentEvent::AgentEnd { .. })).await;
    let end = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::AgentEnd { messages, .. } => Some(messages),
            _ => None,
        })
        .expect("agent_end event");
    assert_eq!(end.last().unwrap().content, "recovered");

    drop(handle);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
}

#[tokio::test]
async fn transient_failure_retries_twice_then_succeeds() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Err(LlmError::RateLimited { retry_after_ms: 10 }),
        Err(LlmError::RateLimited { retry_after_ms: 10 }),
        Ok(vec![
            StreamEvent::TextStart,
            StreamEvent::TextDelta("finally".to_string()),
            StreamEvent::ResponseDone { usage: None },
        ]),
    ]));
    let tools = Arc::new(mock_registry());
    let emitter = Arc::new(EventEmitter::new(true));
    let session_id = SessionKey::new("retry");
    let mut rx = emitter.subscribe(&session_id);

    let mut config = AgentConfig::default();
    config.max_retries = 5;
    config.retry_base_delay_ms = 50;
    config.retry_max_delay_ms = 200;

    let (runtime, handle) = AgentRuntime::new(
        session_id,
        config,
        "/tmp".into(),
        provider,
        tools,
        None,
        emitter,
    );
    let task = tokio::spawn(runtime.run());
    handle.prompt("go").await;

    let events = drain_until(&mut rx, |e| matches!(e, AgentEvent::AgentEnd { .. })).await;
    let retries: Vec<(u32, u64)> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Retry {
                attempt, delay_ms, ..
            } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, 50), (2, 100)]);

    let end = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::AgentEnd { messages, .. } => Some(messages),
            _ => None,
        })
        .expect("agent_end event");
    assert_eq!(end.last().unwrap().content, "finally");

    drop(handle);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let provider = Arc::new(ScriptedProvider::new(vec![Err(LlmError::AuthFailed(
        "invalid_api_key".to_string(),
    ))]));
    let tools = Arc::new(mock_registry());
    let emitter = Arc::new(EventEmitter::new(true));
    let session_id = SessionKey::new("permanent");
    let mut rx = emitter.subscribe(&session_id);

    let (runtime, handle) = AgentRuntime::new(
        session_id,
        AgentConfig::default(),
        "/tmp".into(),
        provider.clone(),
        tools,
        None,
        emitter,
    );
    let task = tokio::spawn(runtime.run());
    handle.prompt("go").await;

    let events = drain_until(&mut rx, |e| matches!(e, AgentEvent::Error { .. })).await;
    assert!(events.iter().any(|e| matches!(e, AgentEvent::Error { .. })));
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Retry { .. })));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    drop(handle);
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
}
