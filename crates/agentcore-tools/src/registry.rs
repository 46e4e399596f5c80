//! The `Tool` trait, execution outcomes, tool effects, and the registry
//! that looks tools up by name.

use agentcore_provider::LlmTool;
use agentcore_types::SessionKey;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A side effect a tool wants applied to agent state before its result is
/// recorded. The runner applies the effect, then substitutes the effect
/// with the `Ok`/`Error` outcome the effect produced.
#[derive(Clone, Debug)]
pub enum ToolEffect {
    /// Load a named skill: the runner appends a system-injected user
    /// message advertising the skill and emits `skill_loaded`.
    LoadSkill { name: String, description: String },
}

/// What a tool's `execute` call produced.
#[derive(Clone, Debug)]
pub enum ToolOutcome {
    Ok(ToolResult),
    Error(String),
    Effect(ToolEffect),
}

impl ToolOutcome {
    pub fn ok(s: impl Into<String>) -> Self {
        Self::Ok(ToolResult::Text(s.into()))
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Clone, Debug)]
pub enum ToolResult {
    Text(String),
    Json(Value),
}

impl ToolResult {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Render as the string stored in a `tool_result` message: strings pass
    /// through as-is, everything else is JSON-encoded.
    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => serde_json::to_string(v).unwrap_or_else(|_| format!("{v:?}")),
        }
    }
}

/// Everything a tool's `execute` needs besides its arguments.
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub session_id: SessionKey,
    pub call_id: String,
    /// Opaque, serialisable view of whatever configuration/state the
    /// caller wants to expose; tools that need structured data deserialize
    /// the parts they recognise and ignore the rest.
    pub config: Value,
}

/// Implement this to add a capability the agent can invoke as a tool.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// System prompt fragment for this tool, injected into LLM context.
    fn prompt(&self) -> &str {
        ""
    }

    fn input_schema(&self) -> Value;

    /// Whether this tool only reads state (no side effects).
    fn is_read_only(&self) -> bool {
        false
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;

    /// Execute with cancellation support. The default races `execute`
    /// against the token; tools that manage a child process should
    /// override this to kill it promptly on cancellation.
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

    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutcome {
        match self.tools.get(name) {
            Some(tool) if tool.is_enabled() => tool.execute(args, ctx).await,
            Some(_) => ToolOutcome::error(format!("tool '{name}' is disabled")),
            None => ToolOutcome::error(format!("tool not found: {name}")),
        }
    }

    pub async fn execute_cancellable(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> ToolOutcome {
        match self.tools.get(name) {
            Some(tool) if tool.is_enabled() => {
                tool.execute_cancellable(args, ctx, cancel).await
            }
            Some(_) => ToolOutcome::error(format!("tool '{name}' is disabled")),
            None => ToolOutcome::error(format!("tool not found: {name}")),
        }
    }

    pub fn get_definitions(&self) -> Vec<LlmTool> {
        self.tools
            .values()
            .filter(|t| t.is_enabled())
            .map(|t| t.to_llm_tool())
            .collect()
    }

    pub fn combined_prompts(&self) -> String {
        self.tools
            .values()
            .filter(|t| t.is_enabled())
            .map(|t| t.prompt())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn list_read_only(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|(_, t)| t.is_read_only())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}
