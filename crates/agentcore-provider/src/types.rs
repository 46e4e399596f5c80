//! Wire-adjacent types: provider request/response shapes and the
//! normalised `StreamEvent` that every provider's raw output is parsed
//! into before it reaches the agent runtime.

use serde::{Deserialize, Serialize};

/// Request sent to a provider for one turn.
#[derive(Clone, Debug, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<LlmTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            tools: None,
            max_tokens: Some(8192),
            temperature: None,
            system: None,
        }
    }
}

/// A message in provider wire format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: LlmContent,
}

/// Message content: either a plain string or an array of typed blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<String> for LlmContent {
    fn from(s: String) -> Self {
        LlmContent::Text(s)
    }
}

impl From<&str> for LlmContent {
    fn from(s: &str) -> Self {
        LlmContent::Text(s.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Tool definition in provider wire format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Token usage as reported by a provider. Either naming convention
/// (`prompt/completion` or `input/output`) is accepted by
/// [`crate::usage::normalize_usage`]-style callers upstream; this struct
/// itself holds the already-normalised values.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Identity fields used to correlate streaming tool-call fragments.
/// Matching tries, in order, `call_id`, `item_id`, then `call_index`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallIdentity {
    pub call_id: Option<String>,
    pub item_id: Option<String>,
    pub call_index: Option<i64>,
}

impl ToolCallIdentity {
    pub fn is_empty(&self) -> bool {
        self.call_id.is_none() && self.item_id.is_none() && self.call_index.is_none()
    }
}

/// A tool call in the middle of being streamed: some fields may still be
/// unset. `name` is set at `tool_call_start`; `arguments_json` accumulates
/// across `tool_call_delta` events; `arguments` is set directly only when
/// a provider supplies pre-parsed arguments at `tool_call_done`.
#[derive(Clone, Debug, Default)]
pub struct PartialToolCall {
    pub identity: ToolCallIdentity,
    pub name: Option<String>,
    pub arguments_json: String,
    pub arguments: Option<serde_json::Value>,
}

/// One normalised event produced by [`crate::provider::LlmProvider::parse_stream_event`].
/// A single raw JSON line may decode to zero, one, or several of these.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    TextStart,
    TextDelta(String),
    TextDone(String),
    ThinkingStart,
    ThinkingDelta(String),
    ToolCallStart(PartialToolCall),
    /// Legacy shape: append to the last (by position) open tool call.
    ToolCallDeltaLegacy(String),
    /// Keyed shape: append to the tool call matched by identity, creating
    /// one if no entry matches yet.
    ToolCallDelta {
        identity: ToolCallIdentity,
        delta: String,
    },
    ToolCallDone(PartialToolCall),
    /// Raw usage payload, forwarded to the usage tracker for normalisation.
    Usage(serde_json::Value),
    ResponseDone { usage: Option<Usage> },
    Error(String),
}
