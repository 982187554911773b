//! The Turn Orchestrator (§4.D): the central state machine that turns one
//! inbound user message into zero or more tool calls and a final reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dotagent_bus::{is_internal_channel, ChannelManager, MessageBus, OutboundEnvelope};
use dotagent_config::AppConfig;
use dotagent_core::ToolCallDescriptor;
use dotagent_llm::{ChatMessage, ChatResponse, LlmRouter, Provider, ToolCall};
use dotagent_memory::{MemoryError, MemoryService, PromptContext};
use dotagent_policy::{classify_mode, eligible_tools, ToolExecutor, TurnMode};
use dotagent_prompt::{assemble, AssembleInputs};
use dotagent_tools::{specs_to_openai_tools, ToolRegistry, ToolResult, ToolSpec};
use tracing::{info, warn};
use uuid::Uuid;

const OVERFLOW_MARKERS: [&str; 4] = ["token", "context", "invalidparameter", "length"];
const FALLBACK_MESSAGE: &str =
    "I can't safely continue this thread right now because prior context is temporarily unavailable. Please retry in a moment.";
const OVERFLOW_NOTICE: &str = "One moment — trimming conversation history to fit the model's context window.";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("missing session: no explicit key and identity fields are incomplete")]
    MissingSession,
    #[error("provider call failed: {0}")]
    ProviderFailed(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Inputs for a single turn (§4.D).
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub session_key: Option<String>,
    pub channel: String,
    pub chat_id: String,
    pub user_id: String,
    pub user_message: String,
    pub default_response: String,
    pub enable_summary: bool,
    pub send_response: bool,
    pub no_history: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            session_key: None,
            channel: "cli".to_string(),
            chat_id: "local".to_string(),
            user_id: "local".to_string(),
            user_message: String::new(),
            default_response: "I don't have a response for that.".to_string(),
            enable_summary: true,
            send_response: true,
            no_history: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_key: String,
    pub final_content: String,
    pub provider_calls: usize,
    pub tool_calls_executed: usize,
}

pub struct TurnOrchestrator {
    pub config: AppConfig,
    pub llm: LlmRouter,
    pub memory: MemoryService,
    pub tools: ToolRegistry,
    pub executor: ToolExecutor,
    pub channels: std::sync::Arc<ChannelManager>,
    pub bus: std::sync::Arc<MessageBus>,
    /// In-memory override of the active model name for the current provider
    /// (§9 "global mutable state"; set via `/switch model to <name>`).
    model_override: std::sync::RwLock<Option<String>>,
    running: AtomicBool,
}

impl TurnOrchestrator {
    pub fn new(
        config: AppConfig,
        llm: LlmRouter,
        memory: MemoryService,
        tools: ToolRegistry,
        executor: ToolExecutor,
        channels: std::sync::Arc<ChannelManager>,
        bus: std::sync::Arc<MessageBus>,
    ) -> Self {
        Self {
            config,
            llm,
            memory,
            tools,
            executor,
            channels,
            bus,
            model_override: std::sync::RwLock::new(None),
            running: AtomicBool::new(true),
        }
    }

    /// Current model name for the active provider, honoring any in-session
    /// `/switch model to <name>` override.
    pub fn current_model(&self) -> String {
        self.model_override
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.config.active_model().to_string())
    }

    /// Updates the in-memory model override; returns `(old, new)`.
    pub fn switch_model(&self, name: &str) -> (String, String) {
        let old = self.current_model();
        *self.model_override.write().unwrap() = Some(name.to_string());
        (old, name.to_string())
    }

    fn ollama_model(&self) -> String {
        if self.config.llm.provider.eq_ignore_ascii_case("openrouter") {
            self.config.llm.ollama_model.clone()
        } else {
            self.current_model()
        }
    }

    fn openrouter_model(&self) -> String {
        if self.config.llm.provider.eq_ignore_ascii_case("openrouter") {
            self.current_model()
        } else {
            self.config.llm.openrouter_model.clone()
        }
    }

    /// Flips the running flag; safe to call from any worker (§5).
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn provider(&self) -> Provider {
        if self.config.llm.provider.eq_ignore_ascii_case("openrouter") {
            Provider::OpenRouter
        } else {
            Provider::Ollama
        }
    }

    fn provider_label(provider: Provider) -> &'static str {
        match provider {
            Provider::Ollama => "ollama",
            Provider::OpenRouter => "openrouter",
        }
    }

    fn publish(&self, channel: &str, chat_id: &str, content: &str) {
        if channel.is_empty() || content.is_empty() {
            return;
        }
        self.bus.publish_outbound(OutboundEnvelope {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
        });
    }

    /// Process one turn end-to-end (§4.D preamble + iteration loop).
    pub async fn process_turn(&self, opts: ProcessOptions) -> Result<TurnOutcome, OrchestratorError> {
        // Preamble step 1: record last-used channel (internal channels excluded).
        if !opts.channel.is_empty() && !opts.chat_id.is_empty() && !is_internal_channel(&opts.channel) {
            self.channels.record_last_used(&opts.channel);
        }

        // Preamble step 2: notify contextual tools.
        self.tools.update_context(&opts.channel, &opts.chat_id);

        // Preamble step 3: resolve the session key.
        let session_key = if opts.no_history {
            dotagent_core::EPHEMERAL_NO_HISTORY.to_string()
        } else {
            dotagent_core::resolve_session_key(
                opts.session_key.as_deref(),
                &self.config.agent.workspace_path,
                &opts.channel,
                &opts.chat_id,
                &opts.user_id,
            )
            .map_err(|_| OrchestratorError::MissingSession)?
        };

        // Preamble step 4.
        self.memory.ensure_session(&session_key)?;

        // Preamble step 5.
        let turn_id = Uuid::new_v4();
        let mut seq: u64 = 1;
        self.memory
            .append_user_event(&session_key, turn_id, seq, &opts.user_message)?;
        seq += 1;
        let persona_report = self
            .memory
            .apply_persona_directives(&session_key, &opts.user_message)?;

        // Preamble step 6.
        let token_budget = self.config.memory.token_budget;
        let context = match self
            .memory
            .build_prompt_context(&session_key, &opts.user_message, token_budget)
        {
            Ok(ctx) => ctx,
            Err(MemoryError::ContinuityUnavailable) => {
                if opts.send_response {
                    self.publish(&opts.channel, &opts.chat_id, FALLBACK_MESSAGE);
                }
                return Ok(TurnOutcome {
                    session_key,
                    final_content: FALLBACK_MESSAGE.to_string(),
                    provider_calls: 0,
                    tool_calls_executed: 0,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let mode = classify_mode(&opts.user_message);
        let eligible_names = eligible_tools(mode, &self.tools, &self.executor.policy);
        let tool_specs: Vec<ToolSpec> = self
            .tools
            .list_specs()
            .into_iter()
            .filter(|s| eligible_names.iter().any(|n| n == &s.name))
            .collect();
        let tools_json = if tool_specs.is_empty() {
            None
        } else {
            Some(specs_to_openai_tools(&tool_specs))
        };

        let persona_note = if persona_report.applied.is_empty() {
            None
        } else {
            Some(format!("Persona updated this turn: {}", persona_report.applied.join("; ")))
        };
        let policy_note = Some(format!(
            "Tool mode: {mode:?}. Eligible tools this turn: {}",
            if eligible_names.is_empty() {
                "none".to_string()
            } else {
                eligible_names.join(", ")
            }
        ));

        let workspace_path = std::path::PathBuf::from(&self.config.agent.workspace_path);
        let memory_db_path = workspace_path.join("state").join("memory.db");
        let skills_dir = workspace_path.join("skills");

        let build_messages = |context: &PromptContext| {
            assemble(&AssembleInputs {
                agent_name: &self.config.agent.name,
                workspace_path: &workspace_path,
                memory_db_path: &memory_db_path,
                skills_dir: &skills_dir,
                channel: &opts.channel,
                chat_id: &opts.chat_id,
                tool_specs: &tool_specs,
                tools_enabled: !tool_specs.is_empty(),
                persona_note: persona_note.as_deref(),
                policy_note: policy_note.as_deref(),
                user_message: &opts.user_message,
                context,
            })
        };

        let mut messages = build_messages(&context);

        let primary = self.provider();
        let max_iterations = self.config.llm.max_tool_iterations.max(1);
        let mut provider_calls = 0usize;
        let mut tool_calls_executed = 0usize;
        let mut user_facing_tool_sent = false;
        let mut final_content: Option<String> = None;

        let mut state_id = self
            .memory
            .get_provider_state(&session_key, Self::provider_label(primary))?;

        'iterations: for _ in 0..max_iterations {
            let mut overflow_retries = 0u8;
            let response: ChatResponse = loop {
                provider_calls += 1;
                let call_result = if primary.is_stateful() {
                    self.llm
                        .chat_with_state(
                            primary,
                            &self.ollama_model(),
                            &self.openrouter_model(),
                            state_id.as_deref(),
                            &messages,
                            tools_json.as_ref(),
                        )
                        .await
                        .map(|(resp, new_state)| {
                            if let Some(id) = new_state {
                                state_id = Some(id);
                            }
                            resp
                        })
                } else {
                    self.llm
                        .chat_messages(
                            primary,
                            &self.ollama_model(),
                            &self.openrouter_model(),
                            &messages,
                            tools_json.as_ref(),
                        )
                        .await
                };

                match call_result {
                    Ok(resp) => break resp,
                    Err(err) => {
                        let lowered = err.to_string().to_lowercase();
                        let is_overflow = OVERFLOW_MARKERS.iter().any(|m| lowered.contains(m));
                        if is_overflow && overflow_retries < 2 {
                            overflow_retries += 1;
                            warn!(session = %session_key, retry = overflow_retries, "context overflow, force-compacting");
                            self.memory.force_compact(&session_key, token_budget)?;
                            let fresh_context = self
                                .memory
                                .build_prompt_context(&session_key, &opts.user_message, token_budget)?;
                            messages = build_messages(&fresh_context);
                            if overflow_retries == 1 && opts.send_response && !is_internal_channel(&opts.channel) {
                                self.publish(&opts.channel, &opts.chat_id, OVERFLOW_NOTICE);
                            }
                            continue;
                        }
                        return Err(OrchestratorError::ProviderFailed(err.to_string()));
                    }
                }
            };

            if primary.is_stateful() {
                if let Some(id) = &state_id {
                    self.memory
                        .set_provider_state(&session_key, Self::provider_label(primary), id)?;
                }
            }

            if response.tool_calls.is_empty() {
                final_content = Some(response.content);
                break 'iterations;
            }

            info!(count = response.tool_calls.len(), "LLM requested tool calls");

            let descriptors: Vec<ToolCallDescriptor> = response
                .tool_calls
                .iter()
                .map(|c| ToolCallDescriptor {
                    tool_call_id: c.id.clone(),
                    tool_name: c.function.name.clone(),
                    arguments: c.function.arguments.clone(),
                })
                .collect();
            self.memory
                .append_assistant_event(&session_key, turn_id, seq, &response.content, descriptors)?;
            seq += 1;
            messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

            let executions = self.execute_tool_calls(mode, &response.tool_calls).await;
            for (call, result) in response.tool_calls.iter().zip(executions.iter()) {
                tool_calls_executed += 1;
                if !result.for_user.is_empty() && !result.silent && opts.send_response {
                    self.publish(&opts.channel, &opts.chat_id, &result.for_user);
                    user_facing_tool_sent = true;
                }
                let content_for_llm = if result.for_llm.is_empty() {
                    result.err.clone().unwrap_or_default()
                } else {
                    result.for_llm.clone()
                };
                messages.push(ChatMessage::tool_result(&call.id, content_for_llm.clone()));
                self.memory.append_tool_event(
                    &session_key,
                    turn_id,
                    seq,
                    &call.id,
                    &call.function.name,
                    &content_for_llm,
                )?;
                seq += 1;
            }
        }

        let mut resolved = final_content.unwrap_or_default();
        if resolved.trim().is_empty() {
            resolved = opts.default_response.clone();
        }
        self.memory
            .append_assistant_event(&session_key, turn_id, seq, &resolved, vec![])?;

        if opts.enable_summary {
            self.memory.force_compact(&session_key, token_budget)?;
        }

        if opts.send_response && !user_facing_tool_sent {
            self.publish(&opts.channel, &opts.chat_id, &resolved);
        }

        Ok(TurnOutcome {
            session_key,
            final_content: resolved,
            provider_calls,
            tool_calls_executed,
        })
    }

    /// Executes a batch of tool calls concurrently (§4.D.1), preserving the
    /// model's emission order when matching results back to messages.
    async fn execute_tool_calls(&self, mode: TurnMode, calls: &[ToolCall]) -> Vec<ToolResult> {
        let futs = calls.iter().map(|call| {
            let tool_name = call.function.name.clone();
            let args = json_value_to_string_map(&call.function.arguments);
            async move { self.executor.execute(&self.tools, mode, &tool_name, &args).await }
        });
        futures::future::join_all(futs).await
    }
}

/// Converts a JSON object value to `HashMap<String, String>` for the tool
/// executor, which works with duck-typed string arguments (§9).
fn json_value_to_string_map(val: &serde_json::Value) -> HashMap<String, String> {
    val.as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_value_to_string_map_handles_types() {
        let val = serde_json::json!({
            "path": "README.md",
            "count": 3,
            "verbose": true,
            "empty": null
        });
        let map = json_value_to_string_map(&val);
        assert_eq!(map["path"], "README.md");
        assert_eq!(map["count"], "3");
        assert_eq!(map["verbose"], "true");
        assert_eq!(map["empty"], "");
    }

    #[test]
    fn default_process_options_send_response_by_default() {
        let opts = ProcessOptions::default();
        assert!(opts.send_response);
        assert!(!opts.no_history);
    }
}
