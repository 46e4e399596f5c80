//! Error text classification and exponential backoff. Pattern lists match
//! case-insensitively against the stringified error reason; an
//! [`agentcore_provider::LlmError`] is consulted first for exact variants
//! (auth/rate-limit/overflow) before falling back to substring matching,
//! so the typed signal takes precedence when it's available.

use agentcore_provider::LlmError;

const OVERFLOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "max_tokens",
    "max_prompt_tokens",
    "too many tokens",
    "prompt is too long",
    "prompt_tokens_exceeded",
    "request too large",
    "context window",
    "token limit",
    "exceeds the limit",
    "input too long",
    "exceeds the model's maximum",
    "reduce the length",
    "maximum number of tokens",
    "content_too_large",
    "string_above_max_length",
];

const PERMANENT_EXTRA_PATTERNS: &[&str] = &["unauthorized", "invalid_api_key", "authentication"];

const TRANSIENT_PATTERNS: &[&str] = &[
    "overloaded",
    "rate_limit",
    "rate limit",
    "too many requests",
    "429",
    "500",
    "502",
    "503",
    "504",
    "connection",
    "econnreset",
    "econnrefused",
    "etimedout",
    "fetch failed",
    "socket hang up",
    "request timeout",
    "server_error",
];

fn matches_any(reason: &str, patterns: &[&str]) -> bool {
    let lower = reason.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

pub fn is_overflow(reason: &str) -> bool {
    matches_any(reason, OVERFLOW_PATTERNS)
}

pub fn is_permanent(reason: &str) -> bool {
    is_overflow(reason) || matches_any(reason, PERMANENT_EXTRA_PATTERNS)
}

pub fn is_transient(reason: &str) -> bool {
    matches_any(reason, TRANSIENT_PATTERNS)
}

/// Permanent takes precedence when both transient and permanent patterns
/// match the same reason.
pub fn is_retryable(reason: &str) -> bool {
    is_transient(reason) && !is_permanent(reason)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Overflow,
    Transient,
    Permanent,
}

pub fn classify(reason: &str) -> Classification {
    if is_overflow(reason) {
        Classification::Overflow
    } else if is_retryable(reason) {
        Classification::Transient
    } else {
        Classification::Permanent
    }
}

/// Classify an [`LlmError`] first by its typed variant, falling back to
/// text classification of its rendered reason for variants (like
/// `RequestFailed`) that carry an opaque provider message.
pub fn classify_llm_error(err: &LlmError) -> Classification {
    match err {
        LlmError::ContextOverflow(_) => Classification::Overflow,
        LlmError::AuthFailed(_) => Classification::Permanent,
        LlmError::RateLimited { .. } => Classification::Transient,
        LlmError::Cancelled => Classification::Permanent,
        _ => classify(&err.reason()),
    }
}

/// `delay(attempt)` for 1-indexed `attempt`: `min(base * 2^(attempt-1), max)`, no jitter.
pub fn delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let attempt = attempt.max(1);
    let shift = (attempt - 1).min(63);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

pub fn usage_overflow(input_tokens: u64, context_window: u64) -> bool {
    input_tokens > context_window
}
