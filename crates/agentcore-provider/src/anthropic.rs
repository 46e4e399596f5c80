//! Reference provider: Anthropic's Messages API over SSE.
//!
//! This is the one concrete provider implementation kept in-tree as a
//! worked example; other providers are expected to implement
//! [`crate::provider::LlmProvider`] the same way. Framing the raw SSE body
//! into individual `data:` lines is the caller's job (see
//! `agentcore-agent::stream_parser`); this module only turns one decoded
//! JSON line into normalised events.

use crate::provider::{LlmError, LlmProvider, LlmResult, ProviderStream};
use crate::types::{
    ContentBlock, LlmContent, LlmMessage, LlmRequest, LlmTool, PartialToolCall, StreamEvent,
    ToolCallIdentity, Usage,
};
use agentcore_types::{Message, Role, ToolDefinition};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> &[&str] {
        &[
            "claude-opus-4-6-20250929",
            "claude-opus-4-6",
            "claude-haiku-4-5-20251001",
        ]
    }

    async fn stream(&self, request: LlmRequest) -> LlmResult<ProviderStream> {
        let body = AnthropicRequest {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.clone(),
                    content: match &m.content {
                        LlmContent::Text(s) => serde_json::json!(s),
                        LlmContent::Blocks(blocks) => {
                            serde_json::to_value(blocks).unwrap_or_default()
                        }
                    },
                })
                .collect(),
            max_tokens: request.max_tokens.unwrap_or(8192),
            stream: true,
            system: request.system.clone(),
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| AnthropicTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.input_schema.clone(),
                    })
                    .collect()
            }),
        };

        debug!(model = %body.model, "starting anthropic stream");

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, body = %error_text, "anthropic request failed");

            return Err(match status.as_u16() {
                401 => LlmError::AuthFailed(error_text),
                429 => LlmError::RateLimited {
                    retry_after_ms: 60_000,
                },
                _ => LlmError::RequestFailed(format!("{}: {}", status, error_text)),
            });
        }

        let cancel = CancellationToken::new();
        let body_stream = response
            .bytes_stream()
            .map(|r| r.map_err(LlmError::NetworkError));

        Ok(ProviderStream::Sse {
            status: status.as_u16(),
            headers: HashMap::new(),
            body: Box::pin(body_stream),
            cancel,
        })
    }

    fn parse_stream_event(&self, json: &str) -> Vec<StreamEvent> {
        let Ok(envelope) = serde_json::from_str::<Envelope>(json) else {
            return Vec::new();
        };

        match envelope.kind.as_str() {
            "content_block_start" => {
                let Ok(data) = serde_json::from_str::<ContentBlockStart>(json) else {
                    return Vec::new();
                };
                match data.content_block {
                    ContentBlockType::ToolUse { id, name } => vec![StreamEvent::ToolCallStart(
                        PartialToolCall {
                            identity: ToolCallIdentity {
                                call_id: Some(id),
                                item_id: None,
                                call_index: Some(data.index as i64),
                            },
                            name: Some(name),
                            arguments_json: String::new(),
                            arguments: None,
                        },
                    )],
                    ContentBlockType::Text { .. } => vec![StreamEvent::TextStart],
                    ContentBlockType::Thinking { .. } => vec![StreamEvent::ThinkingStart],
                }
            }
            "content_block_delta" => {
                let Ok(data) = serde_json::from_str::<ContentBlockDelta>(json) else {
                    return Vec::new();
                };
                match data.delta {
                    DeltaType::TextDelta { text } => vec![StreamEvent::TextDelta(text)],
                    DeltaType::ThinkingDelta { thinking } => {
                        vec![StreamEvent::ThinkingDelta(thinking)]
                    }
                    DeltaType::InputJsonDelta { partial_json } => {
                        vec![StreamEvent::ToolCallDelta {
                            identity: ToolCallIdentity {
                                call_id: None,
                                item_id: None,
                                call_index: Some(data.index as i64),
                            },
                            delta: partial_json,
                        }]
                    }
                }
            }
            "content_block_stop" => {
                let Ok(data) = serde_json::from_str::<ContentBlockStop>(json) else {
                    return Vec::new();
                };
                vec![StreamEvent::ToolCallDone(PartialToolCall {
                    identity: ToolCallIdentity {
                        call_id: None,
                        item_id: None,
                        call_index: Some(data.index as i64),
                    },
                    name: None,
                    arguments_json: String::new(),
                    arguments: None,
                })]
            }
            "message_delta" => {
                let Ok(data) = serde_json::from_str::<MessageDelta>(json) else {
                    return Vec::new();
                };
                if let Some(usage) = data.usage {
                    vec![StreamEvent::ResponseDone { usage: Some(usage) }]
                } else {
                    Vec::new()
                }
            }
            "message_stop" => vec![StreamEvent::ResponseDone { usage: None }],
            "error" => {
                let Ok(data) = serde_json::from_str::<ErrorEvent>(json) else {
                    return Vec::new();
                };
                vec![StreamEvent::Error(data.error.message)]
            }
            _ => Vec::new(),
        }
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<LlmMessage> {
        messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                if let Some(tool_call_id) = &m.tool_call_id {
                    LlmMessage {
                        role: "user".to_string(),
                        content: LlmContent::Blocks(vec![ContentBlock::ToolResult {
                            tool_use_id: tool_call_id.clone(),
                            content: m.content.clone(),
                            is_error: None,
                        }]),
                    }
                } else if let Some(tool_calls) = &m.tool_calls {
                    let mut blocks = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: m.content.clone(),
                        });
                    }
                    for tc in tool_calls {
                        blocks.push(ContentBlock::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input: serde_json::from_str(&tc.arguments)
                                .unwrap_or(serde_json::Value::Null),
                        });
                    }
                    LlmMessage {
                        role: "assistant".to_string(),
                        content: LlmContent::Blocks(blocks),
                    }
                } else {
                    LlmMessage {
                        role: match m.role {
                            Role::User => "user",
                            Role::Assistant => "assistant",
                            Role::Tool => "user",
                            Role::System => unreachable!("filtered above"),
                        }
                        .to_string(),
                        content: LlmContent::Text(m.content.clone()),
                    }
                }
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

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    index: u32,
    content_block: ContentBlockType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlockType {
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(rename = "text")]
    Text {
        #[allow(dead_code)]
        text: Option<String>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: Option<String>,
    },
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    index: u32,
    delta: DeltaType,
}

#[derive(Deserialize)]
struct ContentBlockStop {
    index: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaType {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct MessageDelta {
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("test-key")
    }

    #[test]
    fn parses_text_delta() {
        let events = provider().parse_stream_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        );
        assert!(matches!(&events[..], [StreamEvent::TextDelta(s)] if s == "hi"));
    }

    #[test]
    fn parses_tool_use_start_with_index_identity() {
        let events = provider().parse_stream_event(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"call_1","name":"bash"}}"#,
        );
        match &events[..] {
            [StreamEvent::ToolCallStart(call)] => {
                assert_eq!(call.identity.call_id.as_deref(), Some("call_1"));
                assert_eq!(call.identity.call_index, Some(1));
                assert_eq!(call.name.as_deref(), Some("bash"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_yields_no_events() {
        let events = provider().parse_stream_event(r#"{"type":"ping"}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_json_yields_no_events() {
        let events = provider().parse_stream_event("not json");
        assert!(events.is_empty());
    }

    #[test]
    fn error_event_carries_message() {
        let events = provider().parse_stream_event(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
        );
        assert!(matches!(&events[..], [StreamEvent::Error(m)] if m == "overloaded"));
    }
}
