//! Heuristic token estimation used by the usage tracker's proactive
//! compaction check. Deliberately crude: it must overestimate rather than
//! underestimate, never be exact.

use agentcore_types::Message;

const CHARS_PER_TOKEN: f32 = 4.0;
/// Flat per-message overhead folded into every estimate, covering role
/// markers and structural JSON that `len() / 4` alone would miss.
const MESSAGE_OVERHEAD_TOKENS: usize = 10;

pub struct ContextManager {
    max_tokens: usize,
}

impl ContextManager {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
    }

    pub fn message_tokens(message: &Message) -> usize {
        let mut tokens = Self::estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS;
        if let Some(tool_calls) = &message.tool_calls {
            for tc in tool_calls {
                tokens += Self::estimate_tokens(&tc.name) + Self::estimate_tokens(&tc.arguments);
            }
        }
        tokens
    }

    pub fn calculate_total(&self, messages: &[Message]) -> usize {
        messages.iter().map(Self::message_tokens).sum()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Drop messages from index 1 onward (keeping the system/first message
    /// and the most recent ones) until at or under `target`, or only two
    /// messages remain. Real summarisation lives with the session
    /// collaborator; this is the best-effort fallback.
    pub fn truncate_to(&self, messages: &mut Vec<Message>, target: usize) {
        while messages.len() > 2 && self.calculate_total(messages) > target {
            messages.remove(1);
        }
    }
}
