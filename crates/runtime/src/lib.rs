//! `AgentRuntime`: bootstraps the shared singletons (§5) and runs the bus
//! dispatch loop that drives the Turn Orchestrator and Command Router.
//!
//! Channel adapters are plugged in by the binary that embeds this crate
//! (`dotagent-cli`) as `dotagent_bus::ChannelSink` implementations; this
//! crate only knows about the bus, not about Discord or stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use dotagent_bus::{ChannelManager, ChannelSink, MessageBus};
use dotagent_config::AppConfig;
use dotagent_llm::LlmRouter;
use dotagent_memory::MemoryService;
use dotagent_orchestrator::{route_command, CommandOutcome, ProcessOptions, TurnOrchestrator};
use dotagent_policy::{default_registry, ToolExecutor};

#[derive(Clone)]
pub struct AgentRuntime {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub bus: Arc<MessageBus>,
}

impl AgentRuntime {
    /// Wires up memory, tools, channels and the bus from a loaded config
    /// (§5 "process bootstrap").
    pub fn bootstrap(config: AppConfig) -> Result<Self> {
        let workspace = PathBuf::from(&config.agent.workspace_path);
        let state_dir = workspace.join("state");
        std::fs::create_dir_all(&state_dir).context("creating state directory")?;
        std::fs::create_dir_all(workspace.join("skills")).context("creating skills directory")?;

        let memory = MemoryService::open(&state_dir)?;
        let registry = default_registry(workspace.clone(), state_dir, std::env::var("BRAVE_API_KEY").ok());
        let executor = ToolExecutor::new(config.policy.clone(), workspace);
        let channels = Arc::new(ChannelManager::new(config.channels.enabled.clone()));
        let bus = Arc::new(MessageBus::new(256));

        let orchestrator = Arc::new(TurnOrchestrator::new(
            config,
            LlmRouter::default(),
            memory,
            registry,
            executor,
            channels,
            bus.clone(),
        ));

        Ok(Self { orchestrator, bus })
    }

    fn session_key(&self, channel: &str, chat_id: &str, user_id: &str) -> String {
        dotagent_core::resolve_session_key(
            None,
            &self.orchestrator.config.agent.workspace_path,
            channel,
            chat_id,
            user_id,
        )
        .unwrap_or_else(|_| dotagent_core::EPHEMERAL_NO_HISTORY.to_string())
    }

    /// Processes one message end-to-end: the Command Router first, then the
    /// Turn Orchestrator if it isn't a slash command (§4.D, §4.E). Used by
    /// both `run <message>` and the inbound dispatch worker.
    pub async fn dispatch(
        &self,
        channel: &str,
        chat_id: &str,
        user_id: &str,
        message: &str,
        send_response: bool,
    ) -> Result<String> {
        let session_key = self.session_key(channel, chat_id, user_id);
        match route_command(&self.orchestrator, &session_key, channel, message) {
            CommandOutcome::Reply(text) => Ok(text),
            CommandOutcome::NotACommand => {
                let outcome = self
                    .orchestrator
                    .process_turn(ProcessOptions {
                        session_key: Some(session_key),
                        channel: channel.to_string(),
                        chat_id: chat_id.to_string(),
                        user_id: user_id.to_string(),
                        user_message: message.to_string(),
                        send_response,
                        ..Default::default()
                    })
                    .await?;
                Ok(outcome.final_content)
            }
        }
    }

    /// Spawns the single inbound dispatch worker (§5: "one orchestrator
    /// worker consumes the inbound queue in order"). Replies are published
    /// by `process_turn`/command replies are published here directly, since
    /// command replies never go through the orchestrator's own publish path.
    pub fn spawn_inbound_worker(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let Some(mut rx) = runtime.bus.take_inbound_receiver().await else {
                tracing::error!("inbound receiver already taken; refusing to start a second worker");
                return;
            };
            while runtime.orchestrator.is_running() {
                let Some(envelope) = rx.recv().await else { break };
                let session_key = runtime.session_key(&envelope.channel, &envelope.chat_id, &envelope.sender_id);
                match route_command(&runtime.orchestrator, &session_key, &envelope.channel, &envelope.content) {
                    CommandOutcome::Reply(text) => {
                        runtime.bus.publish_outbound(dotagent_bus::OutboundEnvelope {
                            channel: envelope.channel.clone(),
                            chat_id: envelope.chat_id.clone(),
                            content: text,
                        });
                    }
                    CommandOutcome::NotACommand => {
                        let opts = ProcessOptions {
                            session_key: Some(session_key),
                            channel: envelope.channel.clone(),
                            chat_id: envelope.chat_id.clone(),
                            user_id: envelope.sender_id.clone(),
                            user_message: envelope.content.clone(),
                            send_response: true,
                            ..Default::default()
                        };
                        if let Err(err) = runtime.orchestrator.process_turn(opts).await {
                            tracing::warn!(%err, channel = %envelope.channel, "turn processing failed");
                        }
                    }
                }
            }
        })
    }

    /// Spawns the single outbound dispatch worker, fanning each reply out to
    /// whichever registered sink matches its channel name (§5, §6.1).
    pub fn spawn_outbound_worker(&self, sinks: Vec<Arc<dyn ChannelSink>>) -> JoinHandle<()> {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let Some(mut rx) = bus.take_outbound_receiver().await else {
                tracing::error!("outbound receiver already taken; refusing to start a second worker");
                return;
            };
            while let Some(envelope) = rx.recv().await {
                let Some(sink) = sinks.iter().find(|s| s.channel_name() == envelope.channel) else {
                    tracing::warn!(channel = %envelope.channel, "no sink registered for channel, dropping reply");
                    continue;
                };
                if let Err(err) = sink.deliver(&envelope).await {
                    tracing::warn!(%err, channel = %envelope.channel, "delivery failed");
                }
            }
        })
    }

    /// Configuration/connectivity check for the `doctor` subcommand.
    pub async fn doctor(&self) -> Vec<String> {
        let config = &self.orchestrator.config;
        let mut lines = vec![
            format!("agent: {}", config.agent.name),
            format!("workspace: {}", config.agent.workspace_path),
            format!("provider: {}", config.llm.provider),
            format!("active model: {}", self.orchestrator.current_model()),
            format!("enabled channels: {}", config.channels.enabled.join(", ")),
        ];

        if config.channels.enabled.iter().any(|c| c == "discord") {
            lines.push(format!(
                "discord token configured: {}",
                !config.channels.discord_bot_token.is_empty()
            ));
            lines.push(format!(
                "discord channel id configured: {}",
                !config.channels.discord_channel_id.is_empty()
            ));
        }

        match dotagent_llm::list_ollama_models().await {
            Ok(models) => lines.push(format!("ollama reachable: {} model(s) found", models.len())),
            Err(err) => lines.push(format!("ollama unreachable: {err}")),
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap() -> (AgentRuntime, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.agent.workspace_path = dir.path().to_string_lossy().to_string();
        config.channels.enabled = vec!["cli".to_string()];
        let runtime = AgentRuntime::bootstrap(config).unwrap();
        (runtime, dir)
    }

    #[tokio::test]
    async fn bootstrap_creates_state_and_skills_dirs() {
        let (_runtime, dir) = bootstrap();
        assert!(dir.path().join("state").exists());
        assert!(dir.path().join("skills").exists());
    }

    #[tokio::test]
    async fn dispatch_routes_slash_commands_without_a_provider_call() {
        let (runtime, _dir) = bootstrap();
        let reply = runtime.dispatch("cli", "local", "local", "/show channel", false).await.unwrap();
        assert!(reply.contains("cli"));
    }

    #[tokio::test]
    async fn doctor_reports_agent_and_channel_facts() {
        let (runtime, _dir) = bootstrap();
        let lines = runtime.doctor().await;
        assert!(lines.iter().any(|l| l.starts_with("agent:")));
        assert!(lines.iter().any(|l| l.starts_with("enabled channels:")));
    }
}
