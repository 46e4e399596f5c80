//! Turns provider output into state changes: SSE line framing, per-tag
//! inline-XML buffering across chunk boundaries, and folding normalised
//! [`StreamEvent`]s into [`AgentState`].
//!
//! Framing classifies each line independently rather than buffering whole
//! `\n\n`-delimited blocks, so it behaves the same regardless of which
//! provider produced the bytes.

use crate::events::AgentEvent;
use crate::state::{AgentState, PendingToolCall, Status};
use crate::usage;
use agentcore_provider::types::{PartialToolCall, StreamEvent, ToolCallIdentity, Usage};
use agentcore_types::ToolCall;

/// Feed raw bytes into `buffer`, returning every complete decoded JSON
/// payload line found so far. Partial trailing lines stay in `buffer` for
/// the next call.
pub fn frame_sse_lines(buffer: &mut String, chunk: &[u8]) -> Vec<String> {
    buffer.push_str(&String::from_utf8_lossy(chunk));
    let mut out = Vec::new();

    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim_end_matches('\r').to_string();
        *buffer = buffer[pos + 1..].to_string();

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "data: [DONE]" || trimmed == "data:[DONE]" {
            continue;
        }
        if let Some(rest) = trimmed
            .strip_prefix("data: ")
            .or_else(|| trimmed.strip_prefix("data:"))
        {
            out.push(rest.trim().to_string());
        } else if trimmed.starts_with('{') {
            out.push(trimmed.to_string());
        }
        // anything else (event: lines, comments) is ignored.
    }

    out
}

/// Result of running one tag's extraction over a chunk of text.
struct TagExtraction {
    clean: String,
    found: Vec<String>,
}

/// Per-tag suffix-buffer extraction. See the module docs for the
/// algorithm; `tag` is the bare name (`status`, `title`), no brackets.
fn extract_tag(buffer: &mut String, new_text: &str, tag: &str) -> TagExtraction {
    let mut t = std::mem::take(buffer);
    t.push_str(new_text);

    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut clean = String::new();
    let mut found = Vec::new();

    loop {
        let Some(start) = t.find(&open) else {
            // No opening tag. Check whether the tail of `t` is a non-empty
            // prefix of the opening tag (split across a future chunk).
            let max_check = open.len().min(t.len());
            let mut suffix_len = 0;
            for len in (1..=max_check).rev() {
                let suffix = &t[t.len() - len..];
                if open.starts_with(suffix) {
                    suffix_len = len;
                    break;
                }
            }
            if suffix_len > 0 {
                let split_at = t.len() - suffix_len;
                clean.push_str(&t[..split_at]);
                *buffer = t[split_at..].to_string();
            } else {
                clean.push_str(&t);
                buffer.clear();
            }
            return TagExtraction { clean, found };
        };

        let after_open = start + open.len();
        match t[after_open..].find(&close) {
            Some(end_rel) => {
                let inner_end = after_open + end_rel;
                clean.push_str(&t[..start]);
                found.push(t[after_open..inner_end].trim().to_string());
                t = t[inner_end + close.len()..].to_string();
                // loop again: more tags may follow in the remainder.
            }
            None => {
                clean.push_str(&t[..start]);
                *buffer = t[start..].to_string();
                return TagExtraction { clean, found };
            }
        }
    }
}

fn find_by_identity(calls: &[PendingToolCall], identity: &ToolCallIdentity) -> Option<usize> {
    if let Some(id) = &identity.call_id {
        if let Some(i) = calls.iter().position(|c| c.call_id.as_deref() == Some(id)) {
            return Some(i);
        }
    }
    if let Some(id) = &identity.item_id {
        if let Some(i) = calls.iter().position(|c| c.item_id.as_deref() == Some(id)) {
            return Some(i);
        }
    }
    if let Some(idx) = identity.call_index {
        if let Some(i) = calls.iter().position(|c| c.call_index == Some(idx)) {
            return Some(i);
        }
    }
    None
}

fn find_last_unfinalized(calls: &[PendingToolCall]) -> Option<usize> {
    calls.iter().rposition(|c| !c.finalized)
}

fn upsert_start(calls: &mut Vec<PendingToolCall>, partial: PartialToolCall) {
    match find_by_identity(calls, &partial.identity) {
        Some(i) => {
            let c = &mut calls[i];
            if c.call_id.is_none() {
                c.call_id = partial.identity.call_id;
            }
            if c.item_id.is_none() {
                c.item_id = partial.identity.item_id;
            }
            if c.call_index.is_none() {
                c.call_index = partial.identity.call_index;
            }
            if c.name.is_none() {
                c.name = partial.name;
            }
        }
        None => calls.push(PendingToolCall {
            call_id: partial.identity.call_id,
            item_id: partial.identity.item_id,
            call_index: partial.identity.call_index,
            name: partial.name,
            arguments_json: partial.arguments_json,
            arguments: partial.arguments,
            finalized: false,
        }),
    }
}

fn apply_keyed_delta(calls: &mut Vec<PendingToolCall>, identity: ToolCallIdentity, delta: String) {
    let idx = if identity.is_empty() {
        find_last_unfinalized(calls)
    } else {
        find_by_identity(calls, &identity)
    };

    match idx {
        Some(i) => calls[i].arguments_json.push_str(&delta),
        None if identity.is_empty() => {} // no open call and no identity: no-op
        None => calls.push(PendingToolCall {
            call_id: identity.call_id,
            item_id: identity.item_id,
            call_index: identity.call_index,
            name: None,
            arguments_json: delta,
            arguments: None,
            finalized: false,
        }),
    }
}

fn finalize_call(calls: &mut [PendingToolCall], partial: PartialToolCall) {
    let idx = if partial.identity.is_empty() {
        find_last_unfinalized(calls)
    } else {
        find_by_identity(calls, &partial.identity)
    };
    let Some(i) = idx else { return };
    let c = &mut calls[i];
    c.finalized = true;
    if c.call_id.is_none() {
        c.call_id = partial.identity.call_id;
    }
    if c.name.is_none() {
        c.name = partial.name;
    }
    if partial.arguments.is_some() {
        c.arguments = partial.arguments;
    } else if c.arguments.is_none() && !c.arguments_json.is_empty() {
        c.arguments = serde_json::from_str(&c.arguments_json).ok();
    }
}

/// Convert accumulated pending calls into the final `ToolCall` list,
/// dropping entries with an empty `call_id` or `name`.
pub fn finalize_tool_calls(calls: &[PendingToolCall]) -> Vec<ToolCall> {
    calls
        .iter()
        .filter_map(|c| {
            let id = c.call_id.clone().unwrap_or_default();
            let name = c.name.clone().unwrap_or_default();
            if id.is_empty() || name.is_empty() {
                return None;
            }
            let arguments = c
                .arguments
                .clone()
                .or_else(|| serde_json::from_str(&c.arguments_json).ok())
                .unwrap_or_else(|| serde_json::json!({}));
            Some(ToolCall {
                id,
                name,
                arguments: arguments.to_string(),
            })
        })
        .collect()
}

fn raw_usage_to_usage(raw: &serde_json::Value) -> Option<Usage> {
    let input = raw
        .get("input_tokens")
        .or_else(|| raw.get("prompt_tokens"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let output = raw
        .get("output_tokens")
        .or_else(|| raw.get("completion_tokens"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
    })
}

/// Fold one normalised stream event into state, returning the agent events
/// it produces, in order.
pub fn fold_event(state: &mut AgentState, event: StreamEvent) -> Vec<AgentEvent> {
    let mut out = Vec::new();

    match event {
        StreamEvent::TextStart => {
            if !state.accumulator.message_started {
                state.accumulator.message_started = true;
                out.push(AgentEvent::MessageStart);
            }
        }
        StreamEvent::TextDelta(s) => {
            let mut status_buf = state
                .accumulator
                .tag_buffers
                .remove("status")
                .unwrap_or_default();
            let status_result = extract_tag(&mut status_buf, &s, "status");
            state.accumulator.tag_buffers.insert("status", status_buf);
            for text in status_result.found {
                out.push(AgentEvent::StatusUpdate { text });
            }

            let mut title_buf = state
                .accumulator
                .tag_buffers
                .remove("title")
                .unwrap_or_default();
            let title_result = extract_tag(&mut title_buf, &status_result.clean, "title");
            state.accumulator.tag_buffers.insert("title", title_buf);
            for title in title_result.found {
                let title: String = title.chars().take(60).collect();
                if !title.is_empty() {
                    out.push(AgentEvent::TitleGenerated { title });
                }
            }

            if !title_result.clean.is_empty() {
                out.push(AgentEvent::MessageDelta {
                    delta: title_result.clean.clone(),
                });
            }
            state.accumulator.current_text.push_str(&title_result.clean);
        }
        StreamEvent::TextDone(s) => {
            state.accumulator.current_text = s;
        }
        StreamEvent::ThinkingStart => {
            state.accumulator.current_thinking = Some(String::new());
            out.push(AgentEvent::ThinkingStart);
        }
        StreamEvent::ThinkingDelta(s) => {
            if state.accumulator.current_thinking.is_none() {
                state.accumulator.current_thinking = Some(String::new());
                out.push(AgentEvent::ThinkingStart);
            }
            out.push(AgentEvent::ThinkingDelta { delta: s.clone() });
            state
                .accumulator
                .current_thinking
                .get_or_insert_with(String::new)
                .push_str(&s);
        }
        StreamEvent::ToolCallStart(partial) => {
            upsert_start(&mut state.accumulator.current_tool_calls, partial);
        }
        StreamEvent::ToolCallDeltaLegacy(delta) => {
            if let Some(last) = state.accumulator.current_tool_calls.last_mut() {
                last.arguments_json.push_str(&delta);
            }
        }
        StreamEvent::ToolCallDelta { identity, delta } => {
            apply_keyed_delta(&mut state.accumulator.current_tool_calls, identity, delta);
        }
        StreamEvent::ToolCallDone(partial) => {
            finalize_call(&mut state.accumulator.current_tool_calls, partial);
        }
        StreamEvent::Usage(raw) => {
            if let Some(u) = raw_usage_to_usage(&raw) {
                out.push(usage::update_usage(state, u.input_tokens, u.output_tokens));
            }
        }
        StreamEvent::ResponseDone { usage: Some(u) } => {
            out.push(usage::update_usage(state, u.input_tokens, u.output_tokens));
        }
        StreamEvent::ResponseDone { usage: None } => {}
        StreamEvent::Error(reason) => {
            state.stream_health.stream_errored = Some(reason.clone());
            state.status = Status::Idle;
            out.push(AgentEvent::Error { reason });
        }
    }

    out
}
