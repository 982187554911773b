use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Coarse-grained risk classification used by the approval gate
/// (SPEC_FULL.md §4.B.1), independent of the allow/deny policy below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        SecurityLevel::Low
    }
}

/// Fixed group→names classification used by the tool-policy allow/deny
/// selectors (`group:<g>`). Every built-in tool belongs to exactly one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolGroup {
    Filesystem,
    Shell,
    Web,
    Messaging,
    Workflow,
}

impl ToolGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolGroup::Filesystem => "filesystem",
            ToolGroup::Shell => "shell",
            ToolGroup::Web => "web",
            ToolGroup::Messaging => "messaging",
            ToolGroup::Workflow => "workflow",
        }
    }
}

/// Static metadata about a tool used by the tool policy and approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub security_level: SecurityLevel,
    pub read_only: bool,
    pub group: ToolGroup,
    /// Bypasses the approval gate regardless of `ApprovalMode`.
    pub approval_exempt: bool,
    /// Receives `SetContext(channel, chat_id)` before each turn (§6 Tool interface).
    pub contextual: bool,
}

impl Default for ToolMetadata {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Low,
            read_only: true,
            group: ToolGroup::Workflow,
            approval_exempt: false,
            contextual: false,
        }
    }
}

/// Static description of a tool, used by the LLM to decide which tool to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
    #[serde(default)]
    pub metadata: ToolMetadata,
}

/// The result of one tool invocation (§3 Tool Result).
///
/// `for_llm` is always appended to the conversation as a `tool`-role message.
/// `for_user`, when non-empty and `silent` is `false`, is published to the
/// originating channel immediately — independent of whatever the orchestrator
/// ultimately sends as the turn's final reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub for_llm: String,
    pub for_user: String,
    pub silent: bool,
    pub err: Option<String>,
}

impl ToolResult {
    /// A result with content for the model only; nothing sent to the channel.
    pub fn ok(for_llm: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            for_user: String::new(),
            silent: true,
            err: None,
        }
    }

    /// A result that should also be delivered to the user's channel immediately.
    pub fn ok_for_user(for_llm: impl Into<String>, for_user: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            for_user: for_user.into(),
            silent: false,
            err: None,
        }
    }

    /// A failed invocation; `message` becomes both the LLM-facing content and `err`.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            for_llm: message.clone(),
            for_user: String::new(),
            silent: true,
            err: Some(message),
        }
    }

    /// Bridges tools still written against the plain `{success, output}` shape.
    pub fn from_legacy(success: bool, output: impl Into<String>) -> Self {
        let output = output.into();
        if success {
            ToolResult::ok(output)
        } else {
            ToolResult::error(output)
        }
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

/// Trait implemented by every tool (built-in or externally loaded).
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, args: &HashMap<String, String>) -> Result<ToolResult>;

    /// Contextual tools (per `ToolMetadata::contextual`) are told the current
    /// channel/chat before each turn. Default no-op for context-free tools.
    fn set_context(&self, _channel: &str, _chat_id: &str) {}
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    /// Notify every contextual tool of the current channel/chat (§4.D preamble step 2).
    pub fn update_context(&self, channel: &str, chat_id: &str) {
        for tool in &self.tools {
            if tool.spec().metadata.contextual {
                tool.set_context(channel, chat_id);
            }
        }
    }
}

/// Build the OpenAI-compatible `tools` JSON array from tool specs — the shape
/// the LLM provider contract (§6) expects for `function` definitions.
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> serde_json::Value {
    let defs: Vec<serde_json::Value> = specs
        .iter()
        .map(|spec| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for param in &spec.params {
                properties.insert(
                    param.name.clone(),
                    serde_json::json!({
                        "type": "string",
                        "description": param.description,
                    }),
                );
                if param.required {
                    required.push(serde_json::Value::String(param.name.clone()));
                }
            }
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }
                }
            })
        })
        .collect();
    serde_json::Value::Array(defs)
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;
pub use builtins::{
    CalendarAddEventTool, DraftEmailTool, FetchPageTool, ReadFileTool, RemindMeTool, RunShellTool,
    WebSearchTool, WriteFileTool,
};

// ── ToolRegistry tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod registry_tests {
    use super::*;
    use std::collections::HashMap;

    /// Minimal dummy tool for testing the registry.
    struct DummyTool {
        name: String,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                description: format!("Dummy tool: {}", self.name),
                params: vec![ToolParam::required("input", "test param")],
                metadata: ToolMetadata::default(),
            }
        }
        async fn execute(&self, _args: &HashMap<String, String>) -> Result<ToolResult> {
            Ok(ToolResult::ok(format!("ran {}", self.name)))
        }
    }

    #[test]
    fn empty_registry() {
        let reg = ToolRegistry::default();
        assert!(reg.list_specs().is_empty());
        assert!(reg.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "alpha".into() }));
        reg.register(Box::new(DummyTool { name: "beta".into() }));

        assert!(reg.get("alpha").is_some());
        assert!(reg.get("beta").is_some());
        assert!(reg.get("gamma").is_none());
    }

    #[test]
    fn list_specs_returns_all() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "one".into() }));
        reg.register(Box::new(DummyTool { name: "two".into() }));
        reg.register(Box::new(DummyTool { name: "three".into() }));

        let specs = reg.list_specs();
        assert_eq!(specs.len(), 3);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"one"));
        assert!(names.contains(&"two"));
        assert!(names.contains(&"three"));
    }

    #[tokio::test]
    async fn run_registered_tool() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "runner".into() }));

        let tool = reg.get("runner").unwrap();
        let result = tool.execute(&HashMap::new()).await.unwrap();
        assert!(!result.is_err());
        assert_eq!(result.for_llm, "ran runner");
    }

    /// Duplicate registration: the first tool wins on `get` (Vec + find).
    #[test]
    fn duplicate_name_get_returns_first_registered() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "dup".into() }));
        reg.register(Box::new(DummyTool { name: "dup".into() }));

        let specs = reg.list_specs();
        let dup_count = specs.iter().filter(|s| s.name == "dup").count();
        assert_eq!(dup_count, 2, "both duplicates should appear in list_specs");
        assert!(reg.get("dup").is_some());
    }

    #[test]
    fn specs_to_openai_tools_marks_required_params() {
        let specs = vec![ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web".to_string(),
            params: vec![ToolParam::required("query", "Search query")],
            metadata: ToolMetadata::default(),
        }];
        let tools = specs_to_openai_tools(&specs);
        let arr = tools.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["function"]["name"], "web_search");
        assert_eq!(arr[0]["function"]["parameters"]["required"][0], "query");
    }
}
