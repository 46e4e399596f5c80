//! Spawns one task per tool call, isolates crashes, and folds completions
//! back into state. The owning event loop never touches a tool future
//! directly — it only ever sees a `JoinHandle` and a `ToolOutcome`.

use crate::config::AgentConfig;
use crate::events::AgentEvent;
use crate::state::{AgentState, PendingToolTask, Status};
use agentcore_tools::{ToolEffect, ToolOutcome, ToolRegistry};
use agentcore_types::{Message, SessionKey, ToolCall};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a tool call resolved to, once effects have been applied. Distinct
/// from [`agentcore_tools::ToolOutcome`]: by the time a result lands here
/// there is no `Effect` variant left, only the outcome the effect produced.
#[derive(Clone, Debug)]
pub enum ToolExecutionResult {
    Ok(String),
    Error(String),
}

impl ToolExecutionResult {
    pub fn text(&self) -> &str {
        match self {
            Self::Ok(s) | Self::Error(s) => s,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// A tool call spawned as its own task, plus the handle needed to cancel or
/// await it. The owning loop drives a `FuturesUnordered`/`select!` over
/// `handle`; it never awaits `execute` directly.
pub struct LaunchedTool {
    pub call: ToolCall,
    pub handle: tokio::task::JoinHandle<ToolOutcome>,
    pub cancel: CancellationToken,
}

/// Names of tools eligible to run this turn: not in `disabled_tools`, and
/// gated behind their feature flag if their name marks them as such.
pub fn active_tool_names(
    config: &AgentConfig,
    disabled_tools: &[String],
    registry: &ToolRegistry,
) -> Vec<String> {
    registry
        .list()
        .into_iter()
        .map(str::to_string)
        .filter(|name| !disabled_tools.contains(name) && !config.disabled_tools.contains(name))
        .filter(|name| feature_gate(name, config))
        .collect()
}

fn feature_gate(name: &str, config: &AgentConfig) -> bool {
    if name.starts_with("subagent") && !config.features.sub_agents {
        return false;
    }
    if name.starts_with("mcp") && !config.features.mcp {
        return false;
    }
    if name.starts_with("skill") && !config.features.skills {
        return false;
    }
    if name.starts_with("debug") && !config.features.debug.enabled {
        return false;
    }
    true
}

/// Spawn one task per call. Each task runs to completion or cancellation
/// independently; none of them touch `AgentState`.
pub fn launch_batch(
    registry: Arc<ToolRegistry>,
    calls: &[ToolCall],
    working_dir: &PathBuf,
    session_id: &SessionKey,
    config: serde_json::Value,
) -> Vec<LaunchedTool> {
    calls
        .iter()
        .map(|call| {
            let cancel = CancellationToken::new();
            let task_cancel = cancel.clone();
            let registry = registry.clone();
            let call_owned = call.clone();
            let ctx = agentcore_tools::ToolContext {
                working_dir: working_dir.clone(),
                session_id: session_id.clone(),
                call_id: call.id.clone(),
                config: config.clone(),
            };

            let handle = tokio::spawn(async move {
                let args: serde_json::Value =
                    serde_json::from_str(&call_owned.arguments).unwrap_or(serde_json::Value::Null);
                registry
                    .execute_cancellable(&call_owned.name, args, &ctx, task_cancel)
                    .await
            });

            LaunchedTool {
                call: call.clone(),
                handle,
                cancel,
            }
        })
        .collect()
}

/// Translate a joined task result into `(call, outcome)`, converting a
/// panic into an isolated error rather than propagating it.
pub fn join_result(
    call: ToolCall,
    joined: Result<ToolOutcome, tokio::task::JoinError>,
) -> (ToolCall, ToolOutcome) {
    match joined {
        Ok(outcome) => (call, outcome),
        Err(e) => (call, ToolOutcome::Error(format!("tool task crashed: {e}"))),
    }
}

fn apply_effect(state: &mut AgentState, effect: ToolEffect) -> (ToolExecutionResult, Vec<AgentEvent>) {
    match effect {
        ToolEffect::LoadSkill { name, description } => {
            state.messages.push(Message::user(format!(
                "Skill loaded: {name} — {description}"
            )));
            (
                ToolExecutionResult::Ok(format!("loaded skill '{name}'")),
                vec![AgentEvent::SkillLoaded { name, description }],
            )
        }
    }
}

/// Fold one completed call into state: remove it from the pending set,
/// apply any effect, record the result, and return the events to emit.
pub fn record_result(state: &mut AgentState, call: ToolCall, outcome: ToolOutcome) -> Vec<AgentEvent> {
    state.pending_tool_tasks.remove(&call.id);

    let mut events = Vec::new();
    let exec_result = match outcome {
        ToolOutcome::Ok(result) => ToolExecutionResult::Ok(result.to_content_string()),
        ToolOutcome::Error(reason) => ToolExecutionResult::Error(reason),
        ToolOutcome::Effect(effect) => {
            let (result, effect_events) = apply_effect(state, effect);
            events.extend(effect_events);
            result
        }
    };

    events.push(AgentEvent::ToolExecutionEnd {
        name: call.name.clone(),
        call_id: call.id.clone(),
        is_error: exec_result.is_error(),
        result: exec_result.text().to_string(),
    });

    state.tool_results.push((call, exec_result));
    events
}

pub fn all_settled(state: &AgentState) -> bool {
    state.pending_tool_tasks.is_empty()
}

/// Build `tool_result` messages in the original call order, regardless of
/// the order results actually arrived in.
pub fn finalize_tool_results(state: &AgentState, original_order: &[ToolCall]) -> Vec<Message> {
    original_order
        .iter()
        .filter_map(|call| {
            state
                .tool_results
                .iter()
                .find(|(c, _)| c.id == call.id)
                .map(|(_, result)| match result {
                    ToolExecutionResult::Ok(text) => Message::tool_result(call.id.clone(), text.clone()),
                    ToolExecutionResult::Error(text) => {
                        Message::tool_error_result(call.id.clone(), text.clone())
                    }
                })
        })
        .collect()
}

/// Terminate every in-flight tool task, drop accumulated results, and
/// repair any call left without a result.
pub fn cancel_all(state: &mut AgentState) {
    for (_, task) in state.pending_tool_tasks.drain() {
        task.cancel.cancel();
    }
    state.tool_results.clear();
    crate::repair::repair_orphaned_calls(&mut state.messages);
}

pub fn register_pending(state: &mut AgentState, launched: &[LaunchedTool]) {
    for tool in launched {
        state.pending_tool_tasks.insert(
            tool.call.id.clone(),
            PendingToolTask {
                call: tool.call.clone(),
                cancel: tool.cancel.clone(),
            },
        );
    }
    state.status = Status::ExecutingTools;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use agentcore_tools::mock_registry;

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.to_string(),
        }
    }

    fn state() -> AgentState {
        AgentState::new(SessionKey::new("s1"), AgentConfig::default(), "/tmp".into())
    }

    #[test]
    fn active_tool_names_respects_disabled_list() {
        let config = AgentConfig::default();
        let registry = mock_registry();
        let active = active_tool_names(&config, &["echo".to_string()], &registry);
        assert!(!active.contains(&"echo".to_string()));
        assert!(active.contains(&"fail".to_string()));
    }

    #[test]
    fn active_tool_names_gates_skill_tools_behind_feature_flag() {
        let mut config = AgentConfig::default();
        config.features.skills = false;
        let mut registry = ToolRegistry::new();
        registry.register(agentcore_tools::SkillLoaderTool);
        let active = active_tool_names(&config, &[], &registry);
        assert!(active.is_empty());

        config.features.skills = true;
        let active = active_tool_names(&config, &[], &registry);
        assert_eq!(active, vec!["skill".to_string()]);
    }

    #[tokio::test]
    async fn launch_and_join_roundtrip_for_echo_tool() {
        let registry = Arc::new(mock_registry());
        let calls = vec![call("c1", "echo", r#"{"text":"hi"}"#)];
        let launched = launch_batch(registry, &calls, &PathBuf::from("/tmp"), &SessionKey::new("s1"), serde_json::Value::Null);
        assert_eq!(launched.len(), 1);
        let LaunchedTool { call, handle, .. } = launched.into_iter().next().unwrap();
        let joined = handle.await;
        let (call, outcome) = join_result(call, joined);
        assert_eq!(call.id, "c1");
        assert!(!outcome.is_error());
    }

    #[tokio::test]
    async fn record_result_translates_effect_into_ok_and_emits_skill_loaded() {
        let mut s = state();
        let c = call("c1", "skill", r#"{"name":"git"}"#);
        let events = record_result(
            &mut s,
            c.clone(),
            ToolOutcome::Effect(ToolEffect::LoadSkill {
                name: "git".into(),
                description: "git workflows".into(),
            }),
        );
        assert!(matches!(&events[0], AgentEvent::SkillLoaded { name, .. } if name == "git"));
        assert!(matches!(&events[1], AgentEvent::ToolExecutionEnd { is_error: false, .. }));
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.tool_results.len(), 1);
    }

    #[tokio::test]
    async fn record_result_marks_errors() {
        let mut s = state();
        let c = call("c1", "fail", "{}");
        let events = record_result(&mut s, c, ToolOutcome::Error("boom".into()));
        assert!(matches!(&events[0], AgentEvent::ToolExecutionEnd { is_error: true, .. }));
    }

    #[test]
    fn finalize_preserves_original_call_order_regardless_of_completion_order() {
        let mut s = state();
        let c1 = call("c1", "echo", "{}");
        let c2 = call("c2", "echo", "{}");
        // completed out of order: c2 first
        s.tool_results.push((c2.clone(), ToolExecutionResult::Ok("second".into())));
        s.tool_results.push((c1.clone(), ToolExecutionResult::Ok("first".into())));

        let messages = finalize_tool_results(&s, &[c1, c2]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("c2"));
    }

    #[test]
    fn cancel_all_clears_pending_tasks_and_repairs_orphans() {
        let mut s = state();
        s.messages.push(Message::assistant_with_tools(
            "",
            vec![call("c1", "echo", "{}")],
        ));
        s.pending_tool_tasks.insert(
            "c1".to_string(),
            PendingToolTask {
                call: call("c1", "echo", "{}"),
                cancel: CancellationToken::new(),
            },
        );

        cancel_all(&mut s);

        assert!(s.pending_tool_tasks.is_empty());
        assert!(s.tool_results.is_empty());
        // Layer 1 repair should have appended a synthetic aborted result.
        assert_eq!(s.messages.len(), 2);
        assert_eq!(s.messages[1].tool_call_id.as_deref(), Some("c1"));
        assert!(s.messages[1].is_error);
    }
}
