//! The event set published to subscribers (UI, RPC transport, loggers).
//! One variant per row of the external event contract; payload shapes
//! match exactly.

use agentcore_types::{Message, TokenUsage};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        messages: Vec<Message>,
        final_usage: TokenUsage,
    },
    AgentAbort,
    AgentRecovered,
    RequestStart {
        model: String,
        message_count: usize,
    },
    RequestEnd,
    MessageStart,
    MessageDelta {
        delta: String,
    },
    MessageQueued {
        text: String,
    },
    MessageApplied {
        text: String,
    },
    ThinkingStart,
    ThinkingDelta {
        delta: String,
    },
    ToolExecutionStart {
        name: String,
        call_id: String,
        arguments: serde_json::Value,
    },
    ToolExecutionEnd {
        name: String,
        call_id: String,
        is_error: bool,
        result: String,
    },
    StatusUpdate {
        text: String,
    },
    TitleGenerated {
        title: String,
    },
    UsageUpdate {
        usage: TokenUsage,
    },
    StreamStalled {
        elapsed_seconds: u64,
    },
    SkillLoaded {
        name: String,
        description: String,
    },
    CompactionStart {
        reason: CompactionReason,
    },
    CompactionEnd {
        before: usize,
        after: usize,
    },
    Retry {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    TurnEnd {
        assistant_message: Message,
    },
    Error {
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum CompactionReason {
    MessageCount(usize),
    Overflow,
}
