//! The state owned exclusively by one agent's event loop. Nothing outside
//! `AgentRuntime::run` mutates this directly.
//!
//! `messages` is kept chronological (oldest first, `Vec::push` to append)
//! rather than the newest-first list the original design describes —
//! idiomatic for a `Vec` in Rust, and [`crate::repair`] walks it in
//! reverse wherever the newest-first view is what the algorithm wants.

use crate::config::AgentConfig;
use agentcore_types::{Message, SessionKey, TokenUsage, ToolCall};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Streaming,
    ExecutingTools,
}

/// A tool call still being assembled from streaming deltas.
#[derive(Clone, Debug, Default)]
pub struct PendingToolCall {
    pub call_id: Option<String>,
    pub item_id: Option<String>,
    pub call_index: Option<i64>,
    pub name: Option<String>,
    pub arguments_json: String,
    pub arguments: Option<serde_json::Value>,
    pub finalized: bool,
}

/// Reset at the start of every turn.
#[derive(Default)]
pub struct StreamAccumulator {
    pub current_text: String,
    pub current_thinking: Option<String>,
    pub current_tool_calls: Vec<PendingToolCall>,
    pub tag_buffers: HashMap<&'static str, String>,
    pub message_started: bool,
}

pub struct StreamHealth {
    pub last_chunk_at: Option<std::time::Instant>,
    pub stream_errored: Option<String>,
    pub streaming_cancel: Option<CancellationToken>,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self {
            last_chunk_at: None,
            stream_errored: None,
            streaming_cancel: None,
        }
    }
}

pub struct UsageState {
    pub token_usage: TokenUsage,
    pub last_prompt_tokens: u64,
    pub last_usage_msg_index: usize,
    pub overflow_detected: bool,
    pub context_window: u64,
}

impl Default for UsageState {
    fn default() -> Self {
        Self {
            token_usage: TokenUsage::default(),
            last_prompt_tokens: 0,
            last_usage_msg_index: 0,
            overflow_detected: false,
            context_window: 200_000,
        }
    }
}

pub struct ResilienceState {
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ResilienceState {
    fn default() -> Self {
        Self {
            retry_count: 0,
            max_retries: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
        }
    }
}

/// A tool call actively executing as a spawned task.
pub struct PendingToolTask {
    pub call: ToolCall,
    pub cancel: CancellationToken,
}

pub struct AgentState {
    pub session_id: SessionKey,
    pub model: String,
    pub working_dir: std::path::PathBuf,
    pub config: AgentConfig,

    pub status: Status,

    pub messages: Vec<Message>,

    pub disabled_tools: Vec<String>,

    pub pending_tool_tasks: HashMap<String, PendingToolTask>,
    pub tool_results: Vec<(ToolCall, crate::tool_runner::ToolExecutionResult)>,

    pub accumulator: StreamAccumulator,
    pub stream_health: StreamHealth,
    pub usage: UsageState,
    pub resilience: ResilienceState,

    pub pending_messages: Vec<String>,
}

impl AgentState {
    pub fn new(session_id: SessionKey, config: AgentConfig, working_dir: std::path::PathBuf) -> Self {
        let model = config.default_model.clone();
        let context_window = config.context_window;
        let max_retries = config.max_retries;
        let retry_base_delay_ms = config.retry_base_delay_ms;
        let retry_max_delay_ms = config.retry_max_delay_ms;
        let disabled_tools = config.disabled_tools.clone();
        Self {
            session_id,
            model,
            working_dir,
            config,
            status: Status::Idle,
            messages: Vec::new(),
            disabled_tools,
            pending_tool_tasks: HashMap::new(),
            tool_results: Vec::new(),
            accumulator: StreamAccumulator::default(),
            stream_health: StreamHealth::default(),
            usage: UsageState {
                context_window,
                ..Default::default()
            },
            resilience: ResilienceState {
                max_retries,
                retry_base_delay_ms,
                retry_max_delay_ms,
                ..Default::default()
            },
            pending_messages: Vec::new(),
        }
    }

    pub fn reset_accumulator(&mut self) {
        self.accumulator = StreamAccumulator::default();
    }

    /// Assert invariant 3: `status = executing_tools` iff tasks are pending.
    pub fn status_consistent_with_tasks(&self) -> bool {
        (self.status == Status::ExecutingTools) == !self.pending_tool_tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_idle_with_empty_accumulator() {
        let state = AgentState::new(
            SessionKey::new("s1"),
            AgentConfig::default(),
            std::path::PathBuf::from("/tmp"),
        );
        assert_eq!(state.status, Status::Idle);
        assert!(state.accumulator.current_text.is_empty());
        assert_eq!(state.resilience.retry_count, 0);
        assert!(state.status_consistent_with_tasks());
    }
}
