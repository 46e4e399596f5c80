//! Provider adapters: the `LlmProvider` trait, its wire-adjacent types, and
//! one reference implementation (Anthropic's Messages API).

pub mod anthropic;
pub mod provider;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use provider::{ByteStream, EventStream, LlmError, LlmProvider, LlmResult, ProviderStream};
pub use types::*;
