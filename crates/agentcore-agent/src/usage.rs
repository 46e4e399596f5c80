//! Token accounting and proactive/overflow compaction. Grounded on the
//! teacher's `ContextManager`, generalised into the hybrid estimator the
//! spec calls for: `last_prompt_tokens` (a real number from the last
//! provider response) plus a heuristic estimate for everything appended
//! since.

use crate::config::AgentConfig;
use crate::context::ContextManager;
use crate::events::{AgentEvent, CompactionReason};
use crate::retry::usage_overflow;
use crate::session::SessionCollaborator;
use crate::state::AgentState;

/// Ratio of messages kept (roughly) during ordinary proactive compaction —
/// deliberately less aggressive than overflow recovery.
const PROACTIVE_COMPACT_RATIO: f32 = 0.5;
/// Ratio kept during overflow recovery: "aggressive ... keep ~20%".
const OVERFLOW_COMPACT_RATIO: f32 = 0.2;

/// Fold a provider usage report into state, returning the event to emit.
pub fn update_usage(state: &mut AgentState, input_tokens: u64, output_tokens: u64) -> AgentEvent {
    state.usage.token_usage.input_tokens += input_tokens;
    state.usage.token_usage.output_tokens += output_tokens;
    state.usage.last_prompt_tokens = input_tokens;
    state.usage.last_usage_msg_index = state.messages.len();
    if usage_overflow(input_tokens, state.usage.context_window) {
        state.usage.overflow_detected = true;
    }
    AgentEvent::UsageUpdate {
        usage: state.usage.token_usage,
    }
}

/// Hybrid estimate: last known real prompt token count, plus a heuristic
/// estimate of everything appended since. Must overestimate.
pub fn estimate_current_tokens(state: &AgentState) -> u64 {
    let start = state.usage.last_usage_msg_index.min(state.messages.len());
    let since: u64 = state.messages[start..]
        .iter()
        .map(|m| ContextManager::message_tokens(m) as u64)
        .sum();
    state.usage.last_prompt_tokens + since
}

fn compaction_ratio(config: &AgentConfig) -> f32 {
    let _ = config; // threshold governs *whether*, not *how much*, to compact
    PROACTIVE_COMPACT_RATIO
}

/// Called at the start of every turn. No-op without a Session collaborator.
/// Returns the events to emit, in order.
pub async fn maybe_auto_compact(
    state: &mut AgentState,
    session: Option<&dyn SessionCollaborator>,
) -> Vec<AgentEvent> {
    let Some(session) = session else {
        return Vec::new();
    };

    let estimate = estimate_current_tokens(state);
    let window = state.usage.context_window.max(1);
    if (estimate as f32 / window as f32) < state.config.compaction_threshold {
        return Vec::new();
    }

    let before = state.messages.len();
    let mut events = vec![AgentEvent::CompactionStart {
        reason: CompactionReason::MessageCount(before),
    }];

    session.compact(compaction_ratio(&state.config)).await;
    state.messages = session.get_path().await;
    state.usage.last_prompt_tokens = 0;
    state.usage.last_usage_msg_index = 0;

    events.push(AgentEvent::CompactionEnd {
        before,
        after: state.messages.len(),
    });
    events
}

/// Invoked when a turn structurally detects overflow (input tokens exceeded
/// the context window). Returns `(recovered, events)`: `recovered` tells
/// the caller whether to resume the turn (`true`, with a Session present)
/// or go idle with an error (`false`).
pub async fn handle_overflow_compaction(
    state: &mut AgentState,
    session: Option<&dyn SessionCollaborator>,
) -> (bool, Vec<AgentEvent>) {
    let Some(session) = session else {
        return (
            false,
            vec![AgentEvent::Error {
                reason: "overflow_no_session".to_string(),
            }],
        );
    };

    let before = state.messages.len();
    let mut events = vec![AgentEvent::CompactionStart {
        reason: CompactionReason::Overflow,
    }];

    session.compact(OVERFLOW_COMPACT_RATIO).await;
    state.messages = session.get_path().await;
    state.usage.last_prompt_tokens = 0;
    state.usage.last_usage_msg_index = 0;
    state.usage.overflow_detected = false;

    events.push(AgentEvent::CompactionEnd {
        before,
        after: state.messages.len(),
    });
    (true, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionCollaborator;
    use agentcore_types::{Message, SessionKey};

    fn state_with(context_window: u64, threshold: f32) -> AgentState {
        let mut config = AgentConfig::default();
        config.context_window = context_window;
        config.compaction_threshold = threshold;
        let mut state = AgentState::new(SessionKey::new("s1"), config, "/tmp".into());
        state.usage.context_window = context_window;
        state
    }

    #[test]
    fn update_usage_accumulates_and_flags_overflow() {
        let mut state = state_with(100, 0.8);
        update_usage(&mut state, 50, 10);
        assert_eq!(state.usage.token_usage.input_tokens, 50);
        assert!(!state.usage.overflow_detected);
        update_usage(&mut state, 200, 10);
        assert!(state.usage.overflow_detected);
    }

    #[tokio::test]
    async fn maybe_auto_compact_is_noop_without_session() {
        let mut state = state_with(10, 0.1);
        state.messages.push(Message::user("x".repeat(1000)));
        let events = maybe_auto_compact(&mut state, None).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn maybe_auto_compact_triggers_past_threshold() {
        let mut state = state_with(100, 0.1);
        for i in 0..20 {
            state.messages.push(Message::user(format!("message {i}")));
        }
        let session = InMemorySessionCollaborator::new("s1");
        session.append_many(state.messages.clone()).await;

        let events = maybe_auto_compact(&mut state, Some(&session)).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AgentEvent::CompactionStart { .. }));
        assert!(matches!(events[1], AgentEvent::CompactionEnd { .. }));
        assert_eq!(state.usage.last_prompt_tokens, 0);
    }

    #[tokio::test]
    async fn handle_overflow_compaction_without_session_errors_and_does_not_recover() {
        let mut state = state_with(100, 0.8);
        let (recovered, events) = handle_overflow_compaction(&mut state, None).await;
        assert!(!recovered);
        assert!(matches!(&events[0], AgentEvent::Error { reason } if reason == "overflow_no_session"));
    }

    #[tokio::test]
    async fn handle_overflow_compaction_with_session_recovers_and_resets_usage() {
        let mut state = state_with(100, 0.8);
        for i in 0..10 {
            state.messages.push(Message::user(format!("m{i}")));
        }
        state.usage.overflow_detected = true;
        let session = InMemorySessionCollaborator::new("s1");
        session.append_many(state.messages.clone()).await;

        let (recovered, events) = handle_overflow_compaction(&mut state, Some(&session)).await;
        assert!(recovered);
        assert_eq!(events.len(), 2);
        assert!(!state.usage.overflow_detected);
    }
}
