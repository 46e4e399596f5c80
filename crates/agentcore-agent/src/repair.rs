//! Two-layer enforcement of the tool_call/tool_result pairing invariant.
//!
//! Layer 1 repairs the live, append-only history (deep orphans from
//! aborted turns buried under later valid turns). Layer 2 repositions and
//! backfills on the chronological snapshot actually sent to the provider,
//! never mutating the log itself.

use agentcore_types::{Message, Role};
use std::collections::{HashSet, VecDeque};
use tracing::warn;

const ABORTED_PLACEHOLDER: &str = "[Aborted by user]";
const MISSING_PLACEHOLDER: &str = "[Error: tool result missing]";

/// Layer 1. Walks the history newest-first, appending a synthetic
/// `tool_result` to the end of the log for every `call_id` that has no
/// result anywhere in the history. Where exactly the synthetic result
/// ends up in send order is Layer 2's job; this only guarantees one
/// exists.
pub fn repair_orphaned_calls(messages: &mut Vec<Message>) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut orphans: Vec<String> = Vec::new();

    for msg in messages.iter().rev() {
        match msg.role {
            Role::Tool => {
                if let Some(id) = &msg.tool_call_id {
                    seen.insert(id.clone());
                }
            }
            Role::Assistant => {
                if let Some(calls) = &msg.tool_calls {
                    for tc in calls {
                        if tc.id.is_empty() {
                            continue;
                        }
                        if seen.insert(tc.id.clone()) {
                            orphans.push(tc.id.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    orphans.reverse();
    for call_id in orphans {
        messages.push(Message::tool_error_result(call_id, ABORTED_PLACEHOLDER));
    }
}

/// Layer 2. Returns a new chronological list where every assistant
/// `tool_calls` is immediately followed by exactly one `tool_result` per
/// declared `call_id`, in declaration order. Standalone or duplicate
/// `tool_result`s are dropped; missing ones are synthesised.
pub fn ensure_tool_results(messages: &[Message]) -> Vec<Message> {
    let mut valid_ids: HashSet<&str> = HashSet::new();
    for msg in messages {
        if msg.role == Role::Assistant {
            if let Some(calls) = &msg.tool_calls {
                for tc in calls {
                    if !tc.id.is_empty() {
                        valid_ids.insert(tc.id.as_str());
                    }
                }
            }
        }
    }

    let mut remaining: VecDeque<Message> = messages.iter().cloned().collect();
    let mut out = Vec::with_capacity(messages.len());

    while let Some(msg) = remaining.pop_front() {
        if msg.role == Role::Tool {
            // Standalone tool_result: either it'll be consumed when we
            // process its assistant (already passed — meaning it's
            // orphaned) or it's a duplicate. Either way it's dropped here;
            // valid ones are pulled out of `remaining` below instead.
            continue;
        }

        let has_tool_calls = msg.role == Role::Assistant
            && msg.tool_calls.as_ref().is_some_and(|c| !c.is_empty());

        if !has_tool_calls {
            out.push(msg);
            continue;
        }

        let mut expected: Vec<&str> = Vec::new();
        let mut dedup: HashSet<&str> = HashSet::new();
        for tc in msg.tool_calls.as_ref().unwrap() {
            if tc.id.is_empty() {
                continue;
            }
            if dedup.insert(tc.id.as_str()) {
                expected.push(tc.id.as_str());
            }
        }

        out.push(msg.clone());

        for call_id in expected {
            let found = remaining
                .iter()
                .position(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call_id));

            match found {
                Some(idx) => {
                    let result = remaining.remove(idx).unwrap();
                    out.push(result);
                }
                None => {
                    out.push(Message::tool_error_result(call_id, MISSING_PLACEHOLDER));
                }
            }
        }

        // Any remaining tool_result for this call_id later in the list is
        // a duplicate — drop with a warning instead of re-emitting it.
        let dupes: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.role == Role::Tool
                    && m.tool_call_id
                        .as_deref()
                        .is_some_and(|id| valid_ids.contains(id))
            })
            .map(|(i, _)| i)
            .collect();
        for idx in dupes.into_iter().rev() {
            if let Some(dupe) = remaining.remove(idx) {
                warn!(call_id = ?dupe.tool_call_id, "dropping duplicate tool_result");
            }
        }
    }

    out
}
