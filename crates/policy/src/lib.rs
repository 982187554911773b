//! Tool policy: turn-mode classification, allow/deny selectors, the
//! internal-state guard, and the approval gate.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use dotagent_config::{ApprovalMode, PolicyConfig};
use dotagent_tools::{SecurityLevel, ToolMetadata, ToolRegistry, ToolResult};

// ── Turn-mode classification ─────────────────────────────────────────────────

/// Coarse classification of a user turn, driving which tools the model sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    Conversation,
    WorkspaceOps,
}

/// Tools always available in `conversation` mode, regardless of policy config.
pub const CONVERSATION_TOOLS: &[&str] = &["web_search", "web_fetch"];

fn shell_cue_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(ls|cat|pwd|grep|rg|sed|awk|find)\b").unwrap())
}

fn operational_cue_res() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?i)\b(run|execute)\b.*\b(command|script|shell|tool)\b").unwrap(),
            Regex::new(
                r"(?i)\b(read_file|write_file|append_file|edit_file|list_dir|run_shell|web_fetch|web_search|calendar_add_event|remind_me|draft_email)\b",
            )
            .unwrap(),
            Regex::new(r"(?i)\b(create|write|edit|delete|move|rename|append)\b.*\b(file|directory|folder)\b")
                .unwrap(),
        ]
    })
}

/// Classifies a user message per SPEC_FULL.md §4.B.
pub fn classify_mode(user_message: &str) -> TurnMode {
    let trimmed = user_message.trim();
    if trimmed.starts_with('/') {
        return TurnMode::WorkspaceOps;
    }
    if trimmed.contains("```") {
        return TurnMode::WorkspaceOps;
    }
    if shell_cue_re().is_match(trimmed) {
        return TurnMode::WorkspaceOps;
    }
    if operational_cue_res().iter().any(|re| re.is_match(trimmed)) {
        return TurnMode::WorkspaceOps;
    }
    TurnMode::Conversation
}

// ── Allow/deny selectors ─────────────────────────────────────────────────────

fn group_members(group: &str) -> Option<&'static [&'static str]> {
    match group {
        "filesystem" => Some(&["read_file", "write_file"]),
        "shell" => Some(&["run_shell"]),
        "web" => Some(&["web_search", "web_fetch"]),
        "messaging" => Some(&["draft_email"]),
        "workflow" => Some(&["calendar_add_event", "remind_me"]),
        _ => None,
    }
}

/// Expands a single selector (plain name, `group:<g>`, `prefix:<p>`/`<p>*`)
/// against the full set of known tool names.
fn expand_selector(selector: &str, all_names: &[String]) -> HashSet<String> {
    let mut out = HashSet::new();
    if let Some(group) = selector.strip_prefix("group:") {
        if let Some(members) = group_members(group) {
            out.extend(members.iter().map(|s| s.to_string()));
        }
        return out;
    }
    if let Some(prefix) = selector.strip_prefix("prefix:") {
        out.extend(all_names.iter().filter(|n| n.starts_with(prefix)).cloned());
        return out;
    }
    if let Some(prefix) = selector.strip_suffix('*') {
        out.extend(all_names.iter().filter(|n| n.starts_with(prefix)).cloned());
        return out;
    }
    if all_names.iter().any(|n| n == selector) {
        out.insert(selector.to_string());
    }
    out
}

fn expand_selectors(selectors: &[String], all_names: &[String]) -> HashSet<String> {
    let mut out = HashSet::new();
    for selector in selectors {
        out.extend(expand_selector(selector, all_names));
    }
    out
}

/// Computes the set of tool names eligible for this turn: mode-gated,
/// narrowed by a non-empty configured allow list, and always minus deny.
pub fn eligible_tools(mode: TurnMode, registry: &ToolRegistry, policy: &PolicyConfig) -> Vec<String> {
    let all_names: Vec<String> = registry.list_specs().into_iter().map(|s| s.name).collect();

    let mut candidates: HashSet<String> = match mode {
        TurnMode::Conversation => CONVERSATION_TOOLS
            .iter()
            .map(|s| s.to_string())
            .filter(|n| all_names.contains(n))
            .collect(),
        TurnMode::WorkspaceOps => all_names.iter().cloned().collect(),
    };

    if !policy.allow.is_empty() {
        let allowed = expand_selectors(&policy.allow, &all_names);
        candidates.retain(|n| allowed.contains(n));
    }

    let denied = expand_selectors(&policy.deny, &all_names);
    candidates.retain(|n| !denied.contains(n));

    let mut result: Vec<String> = candidates.into_iter().collect();
    result.sort();
    result
}

// ── Internal-state guard ─────────────────────────────────────────────────────

const STATE_PATH_LITERALS: &[&str] = &["state/memory.db", "state/state.json"];
const STATE_PATH_SUBSTRINGS: &[&str] = &[
    "/state/memory.db",
    "/state/state.json",
    "/.dotagent/workspace/state/",
];

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'')
}

fn touches_internal_state_path(path: &str, workspace_root: Option<&std::path::Path>) -> bool {
    let candidate = strip_quotes(path);
    if STATE_PATH_LITERALS.contains(&candidate) {
        return true;
    }
    if STATE_PATH_SUBSTRINGS.iter().any(|s| candidate.contains(s)) {
        return true;
    }

    let p = std::path::Path::new(candidate);
    let relative = if p.is_absolute() {
        workspace_root.and_then(|root| p.strip_prefix(root).ok())
    } else {
        Some(p)
    };

    if let Some(rel) = relative {
        if rel.components().next() == Some(std::path::Component::Normal(std::ffi::OsStr::new("state"))) {
            return true;
        }
    }
    false
}

fn touches_internal_state_command(command: &str, workspace_root: Option<&std::path::Path>) -> bool {
    let lowered = command.to_lowercase();
    if lowered.contains("sqlite3") && lowered.contains("memory.db") {
        return true;
    }
    command
        .split_whitespace()
        .any(|token| touches_internal_state_path(token, workspace_root))
}

/// Rejects tool calls that attempt to reach the internal workspace state
/// directory directly (SPEC_FULL.md §4.B, internal-state guard).
pub fn validate_tool_call(
    tool_name: &str,
    args: &HashMap<String, String>,
    workspace_root: Option<&std::path::Path>,
) -> Result<()> {
    const PATH_TOOLS: &[&str] = &["read_file", "write_file", "append_file", "edit_file", "list_dir"];
    const COMMAND_TOOLS: &[&str] = &["run_shell", "exec", "process"];

    if PATH_TOOLS.contains(&tool_name) {
        if let Some(path) = args.get("path") {
            if touches_internal_state_path(path, workspace_root) {
                bail!("Tool call blocked by policy: attempted access to internal state directory");
            }
        }
    }
    if COMMAND_TOOLS.contains(&tool_name) {
        if let Some(command) = args.get("command") {
            if touches_internal_state_command(command, workspace_root) {
                bail!("Tool call blocked by policy: attempted access to internal state directory");
            }
        }
    }
    Ok(())
}

// ── Approval gate ─────────────────────────────────────────────────────────────

/// Pure function deciding whether a call needs out-of-band approval
/// (SPEC_FULL.md §4.B.1), independent of the conversation/workspace_ops split.
pub fn requires_approval(metadata: &ToolMetadata, mode: ApprovalMode) -> bool {
    if metadata.approval_exempt || metadata.read_only {
        return false;
    }
    match mode {
        ApprovalMode::Autonomous => false,
        ApprovalMode::Balanced => metadata.security_level == SecurityLevel::High,
        ApprovalMode::Safer => {
            matches!(metadata.security_level, SecurityLevel::Medium | SecurityLevel::High)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub args: HashMap<String, String>,
    pub risk_summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

pub type ApprovalSender = mpsc::Sender<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;
pub type ApprovalReceiver = mpsc::Receiver<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;

pub fn approval_channel() -> (ApprovalSender, ApprovalReceiver) {
    mpsc::channel(16)
}

fn risk_summary(tool_name: &str, args: &HashMap<String, String>) -> String {
    match tool_name {
        "run_shell" => format!(
            "Execute shell command: {}",
            args.get("command").map(String::as_str).unwrap_or("(unknown)")
        ),
        "write_file" => format!(
            "Write to file: {}",
            args.get("path").map(String::as_str).unwrap_or("(unknown)")
        ),
        _ => format!("Execute tool: {tool_name}"),
    }
}

// ── Tool executor ─────────────────────────────────────────────────────────────

/// Orchestrates one tool invocation: policy filtering, the internal-state
/// guard, the approval gate, then `Tool::execute`.
pub struct ToolExecutor {
    pub policy: PolicyConfig,
    pub workspace_root: std::path::PathBuf,
    approval_tx: Option<ApprovalSender>,
}

impl ToolExecutor {
    pub fn new(policy: PolicyConfig, workspace_root: std::path::PathBuf) -> Self {
        Self {
            policy,
            workspace_root,
            approval_tx: None,
        }
    }

    pub fn with_approval(mut self, tx: ApprovalSender) -> Self {
        self.approval_tx = Some(tx);
        self
    }

    /// Runs a tool by name, enforcing capability checks, the internal-state
    /// guard, and the approval gate before dispatching to the registry.
    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        mode: TurnMode,
        tool_name: &str,
        args: &HashMap<String, String>,
    ) -> ToolResult {
        let tool = match registry.get(tool_name) {
            Some(t) => t,
            None => return ToolResult::error(format!("unknown tool: {tool_name}")),
        };

        let eligible = eligible_tools(mode, registry, &self.policy);
        if !eligible.iter().any(|n| n == tool_name) {
            return ToolResult::error(format!(
                "Tool call blocked by policy: '{tool_name}' is not permitted in this context"
            ));
        }

        if tool_name == "run_shell" && !self.policy.allow_shell {
            return ToolResult::error(
                "Tool call blocked by policy: shell execution is disabled".to_string(),
            );
        }

        if let Err(err) = validate_tool_call(tool_name, args, Some(&self.workspace_root)) {
            warn!(tool = tool_name, %err, "tool call rejected by internal-state guard");
            return ToolResult::error(err.to_string());
        }

        let metadata = tool.spec().metadata;
        if requires_approval(&metadata, self.policy.approval_mode) {
            match self.request_approval(tool_name, args).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(tool = tool_name, "tool execution denied by approval gate");
                    return ToolResult::error(format!("execution of '{tool_name}' denied"));
                }
                Err(err) => return ToolResult::error(err.to_string()),
            }
        }

        info!(tool = tool_name, "executing tool");
        match tool.execute(args).await {
            Ok(result) => result,
            Err(err) => ToolResult::error(err.to_string()),
        }
    }

    async fn request_approval(&self, tool_name: &str, args: &HashMap<String, String>) -> Result<bool> {
        if self.policy.approval_exempt_tools.iter().any(|t| t == tool_name) {
            return Ok(true);
        }
        let Some(tx) = &self.approval_tx else {
            warn!(tool = tool_name, "approval required but no approval channel configured; denying");
            return Ok(false);
        };

        let request = ApprovalRequest {
            tool_name: tool_name.to_string(),
            args: args.clone(),
            risk_summary: risk_summary(tool_name, args),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((request, reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("approval channel closed"))?;
        let decision = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("approval response channel dropped"))?;
        Ok(decision == ApprovalDecision::Approve)
    }
}

// ── Convenience: default registry with built-in tools ────────────────────────

pub fn default_registry(
    workspace_root: std::path::PathBuf,
    agent_data_dir: std::path::PathBuf,
    brave_api_key: Option<String>,
) -> ToolRegistry {
    use dotagent_tools::{
        CalendarAddEventTool, DraftEmailTool, FetchPageTool, ReadFileTool, RemindMeTool,
        RunShellTool, WebSearchTool, WriteFileTool,
    };

    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ReadFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(WriteFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(RunShellTool { workspace_root }));
    registry.register(Box::new(WebSearchTool { brave_api_key }));
    registry.register(Box::new(FetchPageTool));
    registry.register(Box::new(CalendarAddEventTool { data_dir: agent_data_dir.clone() }));
    registry.register(Box::new(DraftEmailTool { data_dir: agent_data_dir.clone() }));
    registry.register(Box::new(RemindMeTool { data_dir: agent_data_dir }));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── classify_mode ──────────────────────────────────────────────────────

    #[test]
    fn slash_command_is_workspace_ops() {
        assert_eq!(classify_mode("/show model"), TurnMode::WorkspaceOps);
    }

    #[test]
    fn code_fence_is_workspace_ops() {
        assert_eq!(classify_mode("run this:\n```\nls -la\n```"), TurnMode::WorkspaceOps);
    }

    #[test]
    fn shell_literal_at_line_start_is_workspace_ops() {
        assert_eq!(classify_mode("ls -la /tmp"), TurnMode::WorkspaceOps);
    }

    #[test]
    fn operational_cue_tool_name_is_workspace_ops() {
        assert_eq!(classify_mode("please run_shell echo hi"), TurnMode::WorkspaceOps);
    }

    #[test]
    fn file_operation_cue_is_workspace_ops() {
        assert_eq!(classify_mode("create a file named notes.txt"), TurnMode::WorkspaceOps);
    }

    #[test]
    fn plain_chat_is_conversation() {
        assert_eq!(classify_mode("how was your day?"), TurnMode::Conversation);
    }

    // ── eligible_tools ─────────────────────────────────────────────────────

    fn test_registry() -> ToolRegistry {
        default_registry(std::env::temp_dir(), std::env::temp_dir(), None)
    }

    #[test]
    fn conversation_mode_limits_to_web_tools() {
        let registry = test_registry();
        let policy = PolicyConfig::default();
        let names = eligible_tools(TurnMode::Conversation, &registry, &policy);
        assert!(names.iter().all(|n| n == "web_search" || n == "web_fetch"));
    }

    #[test]
    fn workspace_ops_mode_allows_all_registered() {
        let registry = test_registry();
        let policy = PolicyConfig::default();
        let names = eligible_tools(TurnMode::WorkspaceOps, &registry, &policy);
        assert!(names.contains(&"read_file".to_string()));
        assert!(names.contains(&"run_shell".to_string()));
    }

    #[test]
    fn deny_group_removes_filesystem_tools() {
        let registry = test_registry();
        let policy = PolicyConfig {
            deny: vec!["group:filesystem".to_string()],
            ..Default::default()
        };
        let names = eligible_tools(TurnMode::WorkspaceOps, &registry, &policy);
        assert!(!names.contains(&"read_file".to_string()));
        assert!(!names.contains(&"write_file".to_string()));
        assert!(names.contains(&"run_shell".to_string()));
    }

    #[test]
    fn allow_prefix_narrows_to_matching_names() {
        let registry = test_registry();
        let policy = PolicyConfig {
            allow: vec!["prefix:web".to_string()],
            ..Default::default()
        };
        let names = eligible_tools(TurnMode::WorkspaceOps, &registry, &policy);
        assert_eq!(names, vec!["web_fetch".to_string(), "web_search".to_string()]);
    }

    #[test]
    fn deny_overrides_allow() {
        let registry = test_registry();
        let policy = PolicyConfig {
            allow: vec!["read_file".to_string()],
            deny: vec!["read_file".to_string()],
            ..Default::default()
        };
        let names = eligible_tools(TurnMode::WorkspaceOps, &registry, &policy);
        assert!(names.is_empty());
    }

    // ── internal-state guard ──────────────────────────────────────────────

    #[test]
    fn blocks_literal_state_memory_db_path() {
        let mut args = HashMap::new();
        args.insert("path".to_string(), "state/memory.db".to_string());
        assert!(validate_tool_call("read_file", &args, None).is_err());
    }

    #[test]
    fn blocks_nested_state_json_substring() {
        let mut args = HashMap::new();
        args.insert("path".to_string(), "./sub/state/state.json".to_string());
        assert!(validate_tool_call("read_file", &args, None).is_err());
    }

    #[test]
    fn blocks_dotagent_workspace_state_substring() {
        let mut args = HashMap::new();
        args.insert("path".to_string(), "/.dotagent/workspace/state/memory.db".to_string());
        assert!(validate_tool_call("write_file", &args, None).is_err());
    }

    #[test]
    fn blocks_bare_state_directory_listing() {
        let mut args = HashMap::new();
        args.insert("path".to_string(), "state".to_string());
        assert!(validate_tool_call("list_dir", &args, None).is_err());
    }

    #[test]
    fn allows_unrelated_path() {
        let mut args = HashMap::new();
        args.insert("path".to_string(), "notes.txt".to_string());
        assert!(validate_tool_call("read_file", &args, None).is_ok());
    }

    #[test]
    fn blocks_sqlite3_memory_db_command() {
        let mut args = HashMap::new();
        args.insert("command".to_string(), "sqlite3 state/memory.db '.dump'".to_string());
        assert!(validate_tool_call("run_shell", &args, None).is_err());
    }

    #[test]
    fn allows_unrelated_command() {
        let mut args = HashMap::new();
        args.insert("command".to_string(), "echo hello".to_string());
        assert!(validate_tool_call("run_shell", &args, None).is_ok());
    }

    // ── requires_approval ──────────────────────────────────────────────────

    #[test]
    fn autonomous_never_requires_approval() {
        let meta = ToolMetadata { security_level: SecurityLevel::High, read_only: false, ..Default::default() };
        assert!(!requires_approval(&meta, ApprovalMode::Autonomous));
    }

    #[test]
    fn balanced_requires_approval_for_high_only() {
        let high = ToolMetadata { security_level: SecurityLevel::High, read_only: false, ..Default::default() };
        let medium = ToolMetadata { security_level: SecurityLevel::Medium, read_only: false, ..Default::default() };
        assert!(requires_approval(&high, ApprovalMode::Balanced));
        assert!(!requires_approval(&medium, ApprovalMode::Balanced));
    }

    #[test]
    fn safer_requires_approval_for_medium_and_high() {
        let medium = ToolMetadata { security_level: SecurityLevel::Medium, read_only: false, ..Default::default() };
        let high = ToolMetadata { security_level: SecurityLevel::High, read_only: false, ..Default::default() };
        assert!(requires_approval(&medium, ApprovalMode::Safer));
        assert!(requires_approval(&high, ApprovalMode::Safer));
    }

    #[test]
    fn read_only_is_always_exempt() {
        let meta = ToolMetadata { security_level: SecurityLevel::High, read_only: true, ..Default::default() };
        assert!(!requires_approval(&meta, ApprovalMode::Safer));
    }

    #[test]
    fn approval_exempt_flag_bypasses_everything() {
        let meta = ToolMetadata {
            security_level: SecurityLevel::High,
            read_only: false,
            approval_exempt: true,
            ..Default::default()
        };
        assert!(!requires_approval(&meta, ApprovalMode::Safer));
    }

    // ── ToolExecutor integration ───────────────────────────────────────────

    #[tokio::test]
    async fn shell_blocked_when_capability_disabled() {
        let workspace = std::env::temp_dir().join("dotagent-policy-shell-test");
        std::fs::create_dir_all(&workspace).unwrap();
        let policy = PolicyConfig { allow_shell: false, ..Default::default() };
        let executor = ToolExecutor::new(policy, workspace.clone());
        let registry = default_registry(workspace, std::env::temp_dir().join("dotagent-policy-shell-data"), None);

        let mut args = HashMap::new();
        args.insert("command".to_string(), "echo hi".to_string());
        let result = executor.execute(&registry, TurnMode::WorkspaceOps, "run_shell", &args).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_file_within_workspace_succeeds() {
        let workspace = std::env::temp_dir().join("dotagent-policy-read-test");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("hello.txt"), "Hello, world!").unwrap();

        let policy = PolicyConfig { approval_mode: ApprovalMode::Autonomous, ..Default::default() };
        let executor = ToolExecutor::new(policy, workspace.clone());
        let registry = default_registry(workspace, std::env::temp_dir().join("dotagent-policy-read-data"), None);

        let mut args = HashMap::new();
        args.insert("path".to_string(), "hello.txt".to_string());
        let result = executor.execute(&registry, TurnMode::WorkspaceOps, "read_file", &args).await;
        assert!(!result.is_err());
        assert_eq!(result.for_llm, "Hello, world!");
    }

    #[tokio::test]
    async fn conversation_mode_blocks_filesystem_tool() {
        let workspace = std::env::temp_dir().join("dotagent-policy-conv-test");
        std::fs::create_dir_all(&workspace).unwrap();

        let policy = PolicyConfig::default();
        let executor = ToolExecutor::new(policy, workspace.clone());
        let registry = default_registry(workspace, std::env::temp_dir().join("dotagent-policy-conv-data"), None);

        let mut args = HashMap::new();
        args.insert("path".to_string(), "hello.txt".to_string());
        let result = executor.execute(&registry, TurnMode::Conversation, "read_file", &args).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_tool_returns_error() {
        let workspace = std::env::temp_dir().join("dotagent-policy-unknown-test");
        std::fs::create_dir_all(&workspace).unwrap();
        let policy = PolicyConfig::default();
        let executor = ToolExecutor::new(policy, workspace.clone());
        let registry = default_registry(workspace, std::env::temp_dir().join("dotagent-policy-unknown-data"), None);

        let result = executor
            .execute(&registry, TurnMode::WorkspaceOps, "nonexistent_tool", &HashMap::new())
            .await;
        assert!(result.is_err());
    }
}
