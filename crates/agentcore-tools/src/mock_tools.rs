//! Deterministic tools used across the test suite. Concrete tool
//! implementations (shell execution, file I/O) are an external concern;
//! these stand in for them so the runner, registry, and active-tool
//! filter can be exercised without a real shell or filesystem.

use crate::registry::{Tool, ToolContext, ToolEffect, ToolOutcome, ToolResult};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Echoes its `text` argument back. Read-only.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the given text back."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutcome {
        let text = args.get("text").and_then(Value::as_str).unwrap_or("");
        ToolOutcome::ok(text.to_string())
    }
}

/// Sleeps for `millis` then returns `"done"`. Stands in for a tool whose
/// cancellation races a long-running operation instead of a subprocess.
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for the given number of milliseconds."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"millis": {"type": "integer"}},
            "required": ["millis"],
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutcome {
        let millis = args.get("millis").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
        ToolOutcome::ok("done")
    }

    async fn execute_cancellable(
        &self,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> ToolOutcome {
        tokio::select! {
            result = self.execute(args, ctx) => result,
            _ = cancel.cancelled() => ToolOutcome::ok("[cancelled]"),
        }
    }
}

/// Always fails. Used to test tool-crash isolation.
pub struct FailTool;

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always returns an error."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::error("deliberate failure")
    }
}

/// Returns a `load_skill` effect instead of a plain result.
pub struct SkillLoaderTool;

#[async_trait]
impl Tool for SkillLoaderTool {
    fn name(&self) -> &str {
        "load_skill"
    }

    fn description(&self) -> &str {
        "Loads a named skill."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolOutcome {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        ToolOutcome::Effect(ToolEffect::LoadSkill {
            description: format!("skill '{name}' loaded"),
            name,
        })
    }
}

/// Returns a JSON blob instead of text, to exercise [`ToolResult::Json`]
/// rendering.
pub struct JsonTool;

#[async_trait]
impl Tool for JsonTool {
    fn name(&self) -> &str {
        "json_probe"
    }

    fn description(&self) -> &str {
        "Returns a small JSON object."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::Ok(ToolResult::Json(serde_json::json!({"ok": true})))
    }
}
