//! Application configuration: a single `AppConfig` loaded from TOML with
//! `#[serde(default)]` throughout, so a missing or partial config file still
//! produces a bootable configuration (§1.1 ambient stack).

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    pub workspace_path: String,
    pub thinking_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "dotagent".to_string(),
            user_name: String::new(),
            workspace_path: ".".to_string(),
            thinking_level: "balanced".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    pub ollama_local_first: bool,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    /// Maximum provider tool-calling iterations per turn (`maxToolIterations`).
    pub max_tool_iterations: usize,
    /// Provider HTTP request timeout in seconds (§5, default 300s).
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_local_first: true,
            ollama_base_url: "http://localhost:11434".to_string(),
            max_tool_iterations: 8,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub backend: String,
    /// Approximate token budget the prompt context (history + summary +
    /// recall) must fit within; force-compact targets this on retry.
    pub token_budget: usize,
    pub auto_summary_turn_interval: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: "eventlog".to_string(),
            token_budget: 6_000,
            auto_summary_turn_interval: 12,
        }
    }
}

/// Coarse approval gate, orthogonal to the allow/deny tool policy
/// (SPEC_FULL.md §4.B.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Autonomous,
    Balanced,
    Safer,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        ApprovalMode::Balanced
    }
}

/// Static allow/deny tool selectors, expanded by `dotagent-policy`.
///
/// Each string is one of:
/// - a plain tool name (`"read_file"`)
/// - `group:<g>` for one of the fixed groups (`filesystem`, `shell`, `web`,
///   `messaging`, `workflow`)
/// - `prefix:<p>` or `<p>*` for a prefix match
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub approval_mode: ApprovalMode,
    pub approval_exempt_tools: Vec<String>,
    pub sandbox_enabled: bool,
    pub allow_shell: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OnboardingConfig {
    pub completed: bool,
}

/// Channels enabled for this process and the last-used channel persisted
/// across restarts (§6.1 `ChannelManager`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub enabled: Vec<String>,
    pub discord_bot_token: String,
    pub discord_channel_id: String,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["cli".to_string(), "discord".to_string()],
            discord_bot_token: String::new(),
            discord_channel_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/dotagent.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub policy: PolicyConfig,
    pub telemetry: TelemetryConfig,
    pub onboarding: OnboardingConfig,
    pub channels: ChannelsConfig,
    pub daemon: DaemonConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }
        if let Ok(token) = env::var("DISCORD_BOT_TOKEN") {
            if !token.is_empty() {
                config.channels.discord_bot_token = token;
            }
        }
        if let Ok(channel_id) = env::var("DISCORD_CHANNEL_ID") {
            if !channel_id.is_empty() {
                config.channels.discord_channel_id = channel_id;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            &self.llm.openrouter_model
        } else {
            &self.llm.ollama_model
        }
    }

    pub fn needs_onboarding(&self) -> bool {
        !self.onboarding.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_needs_onboarding() {
        let config = AppConfig::default();
        assert!(config.needs_onboarding());
        assert_eq!(config.active_model(), "llama3.1:8b");
    }

    #[test]
    fn load_from_missing_path_returns_default() {
        let config = AppConfig::load_from("/nonexistent/path/dotagent.toml").unwrap();
        assert_eq!(config.agent.name, "dotagent");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[policy]\napproval_mode = \"safer\"\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.policy.approval_mode, ApprovalMode::Safer);
        assert_eq!(config.agent.name, "dotagent", "unspecified sections still default");
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.llm.provider = "openrouter".to_string();
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.provider, "openrouter");
        assert_eq!(loaded.active_model(), "openai/gpt-4o-mini");
    }
}
