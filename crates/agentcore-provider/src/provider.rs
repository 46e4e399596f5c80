//! The `LlmProvider` trait and the two stream shapes a provider may return.

use crate::types::{LlmMessage, LlmRequest, LlmTool, StreamEvent};
use agentcore_types::{Message, ToolDefinition};
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl LlmError {
    /// Stringified reason, the form the retry/overflow classifier matches
    /// patterns against.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// A pre-parsed stream of normalised events, already demultiplexed by the
/// provider's own transport (e.g. a websocket or SDK event stream).
pub type EventStream = Pin<Box<dyn Stream<Item = LlmResult<StreamEvent>> + Send>>;

/// A raw SSE byte body that the caller must frame and dispatch through
/// [`LlmProvider::parse_stream_event`] (see `agentcore-agent::stream_parser`).
pub type ByteStream = Pin<Box<dyn Stream<Item = LlmResult<Bytes>> + Send>>;

/// The two shapes a provider's `stream` call may return. Both carry their
/// own cancellation handle: dropping the stream alone does not guarantee
/// the underlying connection tears down promptly, so callers that abort a
/// turn cancel the token explicitly.
pub enum ProviderStream {
    Native {
        events: EventStream,
        cancel: CancellationToken,
    },
    Sse {
        status: u16,
        headers: HashMap<String, String>,
        body: ByteStream,
        cancel: CancellationToken,
    },
}

impl ProviderStream {
    pub fn cancel_handle(&self) -> CancellationToken {
        match self {
            ProviderStream::Native { cancel, .. } => cancel.clone(),
            ProviderStream::Sse { cancel, .. } => cancel.clone(),
        }
    }
}

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn models(&self) -> &[&str];

    fn supports_model(&self, model: &str) -> bool {
        self.models()
            .iter()
            .any(|m| *m == model || model.starts_with(m))
    }

    /// Start a turn. The returned stream begins delivering events as the
    /// response arrives; cancelling `ProviderStream::cancel_handle()` stops
    /// delivery.
    async fn stream(&self, request: LlmRequest) -> LlmResult<ProviderStream>;

    /// Decode one line of raw provider output into zero or more normalised
    /// events. Malformed or unrecognised input yields an empty vec rather
    /// than an error — unknown event types are forward-compatibility noise,
    /// not failures.
    fn parse_stream_event(&self, json: &str) -> Vec<StreamEvent>;

    fn convert_messages(&self, messages: &[Message]) -> Vec<LlmMessage>;

    fn convert_tools(&self, tools: &[ToolDefinition]) -> Vec<LlmTool>;
}
