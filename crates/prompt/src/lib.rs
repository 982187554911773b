//! The Prompt Assembler (§4.C): builds the ordered provider message array
//! from identity, policy note, durable summary, recalled memory, truncated
//! history, and the current user input.

use std::path::Path;

use chrono::Local;
use dotagent_core::EventRole;
use dotagent_llm::{ChatMessage, ChatRole};
use dotagent_memory::{HistoryItem, PromptContext};
use dotagent_tools::ToolSpec;

/// Everything the assembler needs beyond the already-built `PromptContext`.
pub struct AssembleInputs<'a> {
    pub agent_name: &'a str,
    pub workspace_path: &'a Path,
    pub memory_db_path: &'a Path,
    pub skills_dir: &'a Path,
    pub channel: &'a str,
    pub chat_id: &'a str,
    pub tool_specs: &'a [ToolSpec],
    pub tools_enabled: bool,
    pub persona_note: Option<&'a str>,
    pub policy_note: Option<&'a str>,
    pub user_message: &'a str,
    pub context: &'a PromptContext,
}

/// Assemble the ordered message array (§4.C steps 1-7).
pub fn assemble(inputs: &AssembleInputs<'_>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    messages.push(system(build_identity_header(inputs)));

    if let Some(bootstrap) = load_bootstrap(inputs.workspace_path) {
        messages.push(system(bootstrap));
    }

    if let Some(skills) = build_skills_summary(inputs.skills_dir) {
        messages.push(system(skills));
    }

    if let Some(session_block) = build_session_block(inputs) {
        messages.push(system(session_block));
    }

    if let Some(note) = inputs.persona_note {
        if !note.trim().is_empty() {
            messages.push(system(note.to_string()));
        }
    }
    if let Some(note) = inputs.policy_note {
        if !note.trim().is_empty() {
            messages.push(system(note.to_string()));
        }
    }

    let history = sanitize_leading_tool_events(&inputs.context.history);
    let last_user_content = history
        .iter()
        .rev()
        .find(|item| item.role == EventRole::User)
        .map(|item| item.content.as_str());

    for item in &history {
        messages.push(history_message(item));
    }

    // Duplicate suppression: skip re-adding the current user message if it
    // already appears as the last retained user event.
    if last_user_content != Some(inputs.user_message) {
        messages.push(user(inputs.user_message.to_string()));
    }

    messages
}

fn system(content: String) -> ChatMessage {
    ChatMessage {
        role: ChatRole::System,
        content: Some(content),
        tool_calls: Vec::new(),
        tool_call_id: None,
    }
}

fn user(content: String) -> ChatMessage {
    ChatMessage {
        role: ChatRole::User,
        content: Some(content),
        tool_calls: Vec::new(),
        tool_call_id: None,
    }
}

fn history_message(item: &HistoryItem) -> ChatMessage {
    let role = match item.role {
        EventRole::System => ChatRole::System,
        EventRole::User => ChatRole::User,
        EventRole::Assistant => ChatRole::Assistant,
        EventRole::Tool => ChatRole::Tool,
    };
    ChatMessage {
        role,
        content: Some(item.content.clone()),
        tool_calls: Vec::new(),
        tool_call_id: item.tool_call_id.clone(),
    }
}

/// Drop a leading run of `tool`-role events with no preceding assistant
/// tool-call — the provider otherwise rejects the message array (§4.C).
fn sanitize_leading_tool_events(history: &[HistoryItem]) -> Vec<HistoryItem> {
    let first_non_tool = history.iter().position(|item| item.role != EventRole::Tool);
    match first_non_tool {
        Some(idx) => history[idx..].to_vec(),
        None => Vec::new(),
    }
}

fn build_identity_header(inputs: &AssembleInputs<'_>) -> String {
    format!(
        "You are {name}, a personal AI agent.\n\
         Runtime: {os}/{arch}.\n\
         Workspace: {workspace}\n\
         Memory DB: {memory_db}\n\
         Skills directory: {skills_dir}\
         {tool_catalog}",
        name = inputs.agent_name,
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        workspace = inputs.workspace_path.display(),
        memory_db = inputs.memory_db_path.display(),
        skills_dir = inputs.skills_dir.display(),
        tool_catalog = build_tool_catalog(inputs),
    )
}

fn build_tool_catalog(inputs: &AssembleInputs<'_>) -> String {
    if !inputs.tools_enabled || inputs.tool_specs.is_empty() {
        return String::new();
    }
    let list = inputs
        .tool_specs
        .iter()
        .map(|spec| format!("  - {}: {}", spec.name, spec.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!("\nAvailable tools this turn:\n{list}")
}

fn load_bootstrap(workspace_path: &Path) -> Option<String> {
    for name in ["AGENT.md", "AGENTS.md"] {
        if let Ok(text) = std::fs::read_to_string(workspace_path.join(name)) {
            if !text.trim().is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn build_skills_summary(skills_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(skills_dir).ok()?;
    let names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    if names.is_empty() {
        return None;
    }
    Some(format!("Available skills: {}", names.join(", ")))
}

fn build_session_block(inputs: &AssembleInputs<'_>) -> Option<String> {
    let mut sections = Vec::new();
    sections.push(format!(
        "## Current Session\nchannel: {}\nchatId: {}\nlocal time: {}",
        inputs.channel,
        inputs.chat_id,
        Local::now().to_rfc3339(),
    ));

    if let Some(summary) = &inputs.context.summary {
        if !summary.trim().is_empty() {
            sections.push(format!("## Summary of Previous Conversation\n{summary}"));
        }
    }

    if let Some(recall) = &inputs.context.recall_prompt {
        if !recall.trim().is_empty() {
            sections.push(recall.clone());
        }
    }

    if sections.len() == 1 && inputs.context.summary.is_none() && inputs.context.recall_prompt.is_none() {
        return Some(sections.remove(0));
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotagent_memory::PromptContext;
    use std::path::PathBuf;

    fn base_context() -> PromptContext {
        PromptContext {
            history: vec![
                HistoryItem { role: EventRole::User, content: "hi".into(), tool_call_id: None },
                HistoryItem { role: EventRole::Assistant, content: "hello!".into(), tool_call_id: None },
            ],
            summary: None,
            recall_prompt: None,
            persona: None,
            provider_state_id: None,
        }
    }

    #[test]
    fn appends_current_user_message_when_not_duplicate() {
        let ws = PathBuf::from("/tmp/ws");
        let ctx = base_context();
        let inputs = AssembleInputs {
            agent_name: "dotagent",
            workspace_path: &ws,
            memory_db_path: &ws.join("state/memory.db"),
            skills_dir: &ws.join("skills"),
            channel: "cli",
            chat_id: "local",
            tool_specs: &[],
            tools_enabled: false,
            persona_note: None,
            policy_note: None,
            user_message: "what's up?",
            context: &ctx,
        };
        let messages = assemble(&inputs);
        let last = messages.last().unwrap();
        assert_eq!(last.role, ChatRole::User);
        assert_eq!(last.content.as_deref(), Some("what's up?"));
    }

    #[test]
    fn suppresses_duplicate_current_user_message() {
        let ws = PathBuf::from("/tmp/ws");
        let ctx = base_context();
        let inputs = AssembleInputs {
            agent_name: "dotagent",
            workspace_path: &ws,
            memory_db_path: &ws.join("state/memory.db"),
            skills_dir: &ws.join("skills"),
            channel: "cli",
            chat_id: "local",
            tool_specs: &[],
            tools_enabled: false,
            persona_note: None,
            policy_note: None,
            user_message: "hi",
            context: &ctx,
        };
        let messages = assemble(&inputs);
        let user_count = messages.iter().filter(|m| m.role == ChatRole::User).count();
        assert_eq!(user_count, 1, "the duplicate trailing user message must be suppressed");
    }

    #[test]
    fn drops_leading_tool_events_with_no_preceding_assistant_call() {
        let mut ctx = base_context();
        ctx.history.insert(
            0,
            HistoryItem { role: EventRole::Tool, content: "orphaned".into(), tool_call_id: Some("x".into()) },
        );
        let sanitized = sanitize_leading_tool_events(&ctx.history);
        assert!(sanitized.iter().all(|i| i.role != EventRole::Tool || sanitized.first().map(|f| f.role) != Some(EventRole::Tool)));
        assert_eq!(sanitized[0].role, EventRole::User);
    }
}
