//! The Command Router (§4.E): handles `/`-prefixed slash commands locally,
//! without calling the provider.

use dotagent_memory::CandidateStatus;

use crate::turn::TurnOrchestrator;

/// Result of routing a message through the command surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The message was a recognized (or malformed-but-slash-prefixed) command;
    /// this is the reply to send, and the provider must not be called.
    Reply(String),
    /// The message does not start with `/`; fall through to the orchestrator.
    NotACommand,
}

fn usage() -> String {
    "Unknown command. Try: /show model, /show channel, /list models, /list channels, \
     /switch model to <name>, /switch channel to <name>, /persona show, /persona revisions, \
     /persona candidates [status], /persona rollback"
        .to_string()
}

fn parse_status(arg: &str) -> Option<CandidateStatus> {
    match arg.to_lowercase().as_str() {
        "pending" => Some(CandidateStatus::Pending),
        "accepted" => Some(CandidateStatus::Accepted),
        "rejected" => Some(CandidateStatus::Rejected),
        _ => None,
    }
}

/// Route a single inbound message. Returns `NotACommand` for anything not
/// starting with `/`; otherwise always returns a `Reply` (unknown/malformed
/// commands get a usage string, per §4.E — they never reach the LLM).
pub fn route_command(orchestrator: &TurnOrchestrator, session_key: &str, channel: &str, message: &str) -> CommandOutcome {
    let trimmed = message.trim();
    if !trimmed.starts_with('/') {
        return CommandOutcome::NotACommand;
    }

    let reply = if trimmed == "/show model" {
        format!("Current model: {}", orchestrator.current_model())
    } else if trimmed == "/show channel" {
        format!("Channel: {channel}")
    } else if trimmed == "/list models" {
        format!(
            "Configured models — ollama: {}, openrouter: {}. Active: {}",
            orchestrator.config.llm.ollama_model,
            orchestrator.config.llm.openrouter_model,
            orchestrator.current_model(),
        )
    } else if trimmed == "/list channels" {
        let channels = orchestrator.channels.enabled_channels();
        if channels.is_empty() {
            "No channels enabled.".to_string()
        } else {
            channels.join(", ")
        }
    } else if let Some(name) = trimmed.strip_prefix("/switch model to ") {
        let name = name.trim();
        if name.is_empty() {
            usage()
        } else {
            let (old, new) = orchestrator.switch_model(name);
            format!("Switched model: {old} -> {new}")
        }
    } else if let Some(name) = trimmed.strip_prefix("/switch channel to ") {
        let name = name.trim();
        if name.is_empty() {
            usage()
        } else {
            match orchestrator.channels.switch_channel(name) {
                Ok(()) => format!("Switched channel to {name}"),
                Err(err) => err.to_string(),
            }
        }
    } else if trimmed == "/persona show" {
        orchestrator
            .memory
            .persona_snapshot(session_key)
            .ok()
            .flatten()
            .unwrap_or_else(|| "No persona recorded yet for this session.".to_string())
    } else if trimmed == "/persona revisions" {
        match orchestrator.memory.persona_revisions(session_key, 10) {
            Ok(revisions) if !revisions.is_empty() => revisions
                .iter()
                .map(|r| format!("rev {}: {} fact(s), {} goal(s)", r.revision, r.facts.len(), r.goals.len()))
                .collect::<Vec<_>>()
                .join("\n"),
            Ok(_) => "No persona revisions recorded yet.".to_string(),
            Err(err) => format!("Could not load persona revisions: {err}"),
        }
    } else if let Some(rest) = trimmed.strip_prefix("/persona candidates") {
        let status = parse_status(rest.trim());
        if !rest.trim().is_empty() && status.is_none() {
            usage()
        } else {
            match orchestrator.memory.persona_candidates(session_key, status) {
                Ok(candidates) if !candidates.is_empty() => candidates
                    .iter()
                    .map(|c| format!("[{:?}] {:?} {} = {} (confidence {:.2})", c.status, c.op, c.field, c.value, c.confidence))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Ok(_) => "No persona candidates recorded.".to_string(),
                Err(err) => format!("Could not load persona candidates: {err}"),
            }
        }
    } else if trimmed == "/persona rollback" {
        match orchestrator.memory.rollback_persona(session_key) {
            Ok(Some(revision)) => format!("Rolled back to persona revision {}.", revision.revision),
            Ok(None) => "Nothing to roll back.".to_string(),
            Err(err) => format!("Rollback failed: {err}"),
        }
    } else {
        usage()
    };

    CommandOutcome::Reply(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotagent_bus::{ChannelManager, MessageBus};
    use dotagent_config::AppConfig;
    use dotagent_llm::LlmRouter;
    use dotagent_memory::MemoryService;
    use dotagent_policy::ToolExecutor;
    use dotagent_tools::ToolRegistry;
    use std::sync::Arc;

    fn orchestrator() -> (TurnOrchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();
        let memory = MemoryService::open_temp(dir.path()).unwrap();
        let channels = Arc::new(ChannelManager::new(vec!["cli".to_string(), "discord".to_string()]));
        let bus = Arc::new(MessageBus::new(16));
        let executor = ToolExecutor::new(config.policy.clone(), dir.path().to_path_buf());
        let orch = TurnOrchestrator::new(config, LlmRouter::default(), memory, ToolRegistry::default(), executor, channels, bus);
        (orch, dir)
    }

    #[test]
    fn non_slash_message_is_not_a_command() {
        let (orch, _dir) = orchestrator();
        assert_eq!(route_command(&orch, "v2:abc", "cli", "hello there"), CommandOutcome::NotACommand);
    }

    #[test]
    fn show_model_reports_active_model() {
        let (orch, _dir) = orchestrator();
        match route_command(&orch, "v2:abc", "cli", "/show model") {
            CommandOutcome::Reply(text) => assert!(text.contains(&orch.current_model())),
            CommandOutcome::NotACommand => panic!("expected a reply"),
        }
    }

    #[test]
    fn switch_model_updates_current_model() {
        let (orch, _dir) = orchestrator();
        let outcome = route_command(&orch, "v2:abc", "cli", "/switch model to llama3.1:70b");
        assert!(matches!(outcome, CommandOutcome::Reply(ref s) if s.contains("llama3.1:70b")));
        assert_eq!(orch.current_model(), "llama3.1:70b");
    }

    #[test]
    fn switch_channel_rejects_unknown_channel() {
        let (orch, _dir) = orchestrator();
        let outcome = route_command(&orch, "v2:abc", "cli", "/switch channel to telegram");
        assert!(matches!(outcome, CommandOutcome::Reply(ref s) if s.contains("unknown channel")));
    }

    #[test]
    fn unknown_command_returns_usage() {
        let (orch, _dir) = orchestrator();
        let outcome = route_command(&orch, "v2:abc", "cli", "/nonsense");
        assert!(matches!(outcome, CommandOutcome::Reply(ref s) if s.starts_with("Unknown command")));
    }

    #[test]
    fn list_channels_lists_enabled_set() {
        let (orch, _dir) = orchestrator();
        let outcome = route_command(&orch, "v2:abc", "cli", "/list channels");
        assert!(matches!(outcome, CommandOutcome::Reply(ref s) if s.contains("cli") && s.contains("discord")));
    }
}
