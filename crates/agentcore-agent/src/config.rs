//! Agent configuration: feature flags, retry/backoff bounds, and the
//! active-tool filter inputs. Nested, all-fields-`#[serde(default)]`
//! configuration style so a partial TOML/JSON document is always a valid
//! config.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_model: String,
    pub context_window: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Threshold in `[0, 1]` of context window usage that triggers
    /// proactive compaction.
    pub compaction_threshold: f32,
    pub disabled_tools: Vec<String>,
    pub features: FeatureFlags,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-opus-4-6-20250929".to_string(),
            context_window: 200_000,
            max_retries: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
            compaction_threshold: 0.80,
            disabled_tools: Vec::new(),
            features: FeatureFlags::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub sub_agents: bool,
    pub mcp: bool,
    pub skills: bool,
    pub debug: DebugConfig,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            sub_agents: false,
            mcp: false,
            skills: false,
            debug: DebugConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

/// Patch applied by the `configure` operation: `None` fields are left
/// untouched and existing values are merged, not replaced.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigPatch {
    pub features: Option<FeatureFlags>,
    pub disabled_tools: Option<Vec<String>>,
}

impl AgentConfig {
    pub fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(features) = patch.features {
            self.features = features;
        }
        if let Some(disabled) = patch.disabled_tools {
            self.disabled_tools = disabled;
        }
    }
}
