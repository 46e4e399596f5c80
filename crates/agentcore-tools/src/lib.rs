//! The tool-side half of the agent core: the `Tool` trait, execution
//! outcomes (including effects), and a name-keyed registry. Concrete tools
//! (shell, file I/O, sub-agent spawning) are an external concern; this
//! crate provides the seam plus a handful of deterministic mock tools used
//! across the test suite.

pub mod mock_tools;
pub mod registry;

pub use mock_tools::{EchoTool, FailTool, JsonTool, SkillLoaderTool, SleepTool};
pub use registry::{Tool, ToolContext, ToolEffect, ToolOutcome, ToolRegistry, ToolResult};

/// A registry preloaded with the mock tools, for tests and examples that
/// need a working registry without a real execution environment.
pub fn mock_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(SleepTool);
    registry.register(FailTool);
    registry.register(SkillLoaderTool);
    registry.register(JsonTool);
    registry
}
