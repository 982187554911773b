//! The Memory Service: persistent event log, recall, durable summary,
//! persona profile, and provider state-id store (§2.E / §3.1 / §4).
//!
//! Non-goal: the on-disk schema of the memory store is not load-bearing for
//! correctness — only the operations below are. The store is a single
//! embedded [`redb`] file at `<workspace>/state/memory.db`.

pub mod persona;
pub mod recall;
pub mod schema;
pub mod store;

use std::path::Path;
use std::sync::RwLock;

use chrono::Utc;
use dotagent_core::{Event, EventRole, ToolCallDescriptor};
use thiserror::Error;
use uuid::Uuid;

pub use persona::{PersonaApplyReport, PersonaDirective};
pub use schema::{
    CandidateOp, CandidateStatus, DurableSummaryRecord, PersonaCandidate, PersonaRevision,
    ProviderStateRecord,
};
pub use store::MemoryStore;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Memory cannot safely build context for this session (§7).
    #[error("continuity unavailable for session")]
    ContinuityUnavailable,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A single history item ready for the prompt assembler.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryItem {
    pub role: EventRole,
    pub content: String,
    pub tool_call_id: Option<String>,
}

/// `(history, summary, recallPrompt)` bounded to a token budget, plus a
/// persona snapshot and the provider state id for this session (§3).
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub history: Vec<HistoryItem>,
    pub summary: Option<String>,
    pub recall_prompt: Option<String>,
    pub persona: Option<PersonaRevision>,
    pub provider_state_id: Option<String>,
}

/// Rough token estimate used for budget accounting: ~4 characters/token,
/// matching the donor's existing heuristic elsewhere in the stack.
fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

pub struct MemoryService {
    store: MemoryStore,
    /// Guards the small amount of in-process state (persona revision cache)
    /// that would otherwise require a read transaction per lookup.
    persona_cache: RwLock<std::collections::HashMap<String, PersonaRevision>>,
}

impl MemoryService {
    pub fn open(workspace_state_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let store = MemoryStore::open(workspace_state_dir.as_ref().join("memory.db"))?;
        Ok(Self {
            store,
            persona_cache: RwLock::new(std::collections::HashMap::new()),
        })
    }

    /// Opens a `MemoryStore` rooted at a caller-owned directory instead of
    /// `<workspace>/state/`. Used by other crates' test harnesses.
    pub fn open_temp(dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            store: MemoryStore::open_temp(dir)?,
            persona_cache: RwLock::new(std::collections::HashMap::new()),
        })
    }

    /// Idempotent: a session "exists" the moment its first event is written,
    /// so this only needs to seed a genesis persona revision.
    pub fn ensure_session(&self, session_key: &str) -> Result<(), MemoryError> {
        if self.store.load_persona_revisions(session_key)?.is_empty() {
            self.store
                .append_persona_revision(&PersonaRevision::genesis(session_key))?;
        }
        Ok(())
    }

    pub fn append_user_event(
        &self,
        session_key: &str,
        turn_id: Uuid,
        seq: u64,
        content: &str,
    ) -> Result<(), MemoryError> {
        let event = Event::user(session_key, turn_id, seq, content);
        self.store.append_event(&event)?;
        Ok(())
    }

    pub fn append_assistant_event(
        &self,
        session_key: &str,
        turn_id: Uuid,
        seq: u64,
        content: &str,
        tool_calls: Vec<ToolCallDescriptor>,
    ) -> Result<(), MemoryError> {
        let event = Event::assistant(session_key, turn_id, seq, content, tool_calls);
        self.store.append_event(&event)?;
        Ok(())
    }

    pub fn append_tool_event(
        &self,
        session_key: &str,
        turn_id: Uuid,
        seq: u64,
        tool_call_id: &str,
        tool_name: &str,
        content: &str,
    ) -> Result<(), MemoryError> {
        let event = Event::tool(session_key, turn_id, seq, tool_call_id, tool_name, content);
        self.store.append_event(&event)?;
        Ok(())
    }

    /// Build the bounded prompt context for a turn (§3, §4.C).
    ///
    /// History is taken newest-first up to `token_budget`, then reversed back
    /// into chronological order; any leading `tool`-role events with no
    /// preceding assistant tool-call are dropped by the caller (§4.C sanitation
    /// lives in the prompt assembler, not here, since it depends on the
    /// in-flight message array shape).
    pub fn build_prompt_context(
        &self,
        session_key: &str,
        user_message: &str,
        token_budget: usize,
    ) -> Result<PromptContext, MemoryError> {
        if session_key == dotagent_core::EPHEMERAL_NO_HISTORY {
            return Ok(PromptContext::default());
        }

        let all_events = self.store.load_events(session_key)?;
        let summary_record = self.store.load_summary(session_key)?;
        let covers_through = summary_record.as_ref().map(|s| s.covers_through_count as usize).unwrap_or(0);
        let covers_through = covers_through.min(all_events.len());

        let (folded, retained) = all_events.split_at(covers_through);

        let mut budget = token_budget;
        let mut kept: Vec<&Event> = Vec::new();
        for event in retained.iter().rev() {
            let cost = estimate_tokens(&event.content);
            if !kept.is_empty() && cost > budget {
                break;
            }
            budget = budget.saturating_sub(cost);
            kept.push(event);
        }
        kept.reverse();

        // A budget-trimmed window can start mid tool-call sequence if the cut
        // falls between an assistant tool-call event and its tool results.
        // Drop any leading tool events so history never begins with one.
        while matches!(kept.first(), Some(event) if event.role == EventRole::Tool) {
            kept.remove(0);
        }

        let history = kept
            .into_iter()
            .map(|e| HistoryItem {
                role: e.role,
                content: e.content.clone(),
                tool_call_id: e.tool_call_id.clone(),
            })
            .collect();

        let recall_prompt = recall::build_recall_prompt(folded, user_message, 5);
        let persona = self.store.load_persona_revisions(session_key)?.pop();
        let provider_state_id = None;

        Ok(PromptContext {
            history,
            summary: summary_record.map(|s| s.text),
            recall_prompt,
            persona,
            provider_state_id,
        })
    }

    /// Fold the oldest events of a session into the durable summary until the
    /// retained tail fits `token_budget` (§4.D step 3, "force-compact").
    ///
    /// This is a lossless-to-the-LLM approximation: rather than re-running a
    /// real summarization model (out of scope here), the oldest retained
    /// events are concatenated onto the existing summary text. A real
    /// deployment would call back into the LLM provider to condense this
    /// block; the interface is shaped so that swap is additive.
    pub fn force_compact(&self, session_key: &str, token_budget: usize) -> Result<(), MemoryError> {
        let all_events = self.store.load_events(session_key)?;
        let mut record = self.store.load_summary(session_key)?.unwrap_or_default();
        let mut covers_through = (record.covers_through_count as usize).min(all_events.len());

        let mut retained_cost: usize = all_events[covers_through..]
            .iter()
            .map(|e| estimate_tokens(&e.content))
            .sum();

        let mut appended = String::new();
        while retained_cost > token_budget && covers_through < all_events.len() {
            let event = &all_events[covers_through];
            retained_cost = retained_cost.saturating_sub(estimate_tokens(&event.content));
            appended.push_str(&format!("\n[{}] {}", role_label(event.role), event.content));
            covers_through += 1;
        }

        if covers_through == record.covers_through_count as usize {
            return Ok(());
        }

        record.text.push_str(&appended);
        record.covers_through_count = covers_through as u64;
        record.updated_at = Some(Utc::now());
        self.store.save_summary(session_key, &record)?;
        Ok(())
    }

    pub fn get_provider_state(&self, session_key: &str, provider: &str) -> Result<Option<String>, MemoryError> {
        Ok(self.store.load_provider_state(session_key, provider)?)
    }

    pub fn set_provider_state(
        &self,
        session_key: &str,
        provider: &str,
        state_id: &str,
    ) -> Result<(), MemoryError> {
        if state_id.is_empty() {
            return Ok(());
        }
        self.store.save_provider_state(&ProviderStateRecord {
            session_key: session_key.to_string(),
            provider: provider.to_string(),
            state_id: state_id.to_string(),
            updated_at: Utc::now(),
        })?;
        Ok(())
    }

    /// Synchronously apply any inline `remember:`/`note:` directives the user
    /// just issued, producing a new persona revision immediately so the very
    /// next prompt reflects it (§4.D step 5).
    pub fn apply_persona_directives(
        &self,
        session_key: &str,
        user_message: &str,
    ) -> Result<PersonaApplyReport, MemoryError> {
        let directives = persona::extract_directives(user_message);
        if directives.is_empty() {
            return Ok(PersonaApplyReport::default());
        }

        let mut current = self
            .store
            .load_persona_revisions(session_key)?
            .pop()
            .unwrap_or_else(|| PersonaRevision::genesis(session_key));

        let mut report = PersonaApplyReport::default();
        for directive in directives {
            let candidate = PersonaCandidate {
                id: Uuid::new_v4().to_string(),
                session_key: session_key.to_string(),
                field: directive.field.to_string(),
                op: directive.op,
                value: directive.value.clone(),
                confidence: 1.0,
                status: CandidateStatus::Accepted,
                created_at: Utc::now(),
            };
            current = persona::apply_candidate(&current, &candidate);
            report.applied.push(format!("{}: {}", directive.field, directive.value));
        }

        self.store.append_persona_revision(&current)?;
        self.persona_cache
            .write()
            .unwrap()
            .insert(session_key.to_string(), current);
        Ok(report)
    }

    pub fn persona_snapshot(&self, session_key: &str) -> Result<Option<String>, MemoryError> {
        Ok(self
            .store
            .load_persona_revisions(session_key)?
            .pop()
            .map(|rev| persona::render_snapshot(&rev)))
    }

    pub fn persona_revisions(&self, session_key: &str, limit: usize) -> Result<Vec<PersonaRevision>, MemoryError> {
        let mut revisions = self.store.load_persona_revisions(session_key)?;
        revisions.reverse();
        revisions.truncate(limit);
        Ok(revisions)
    }

    pub fn persona_candidates(
        &self,
        session_key: &str,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<PersonaCandidate>, MemoryError> {
        let mut candidates = self.store.load_persona_candidates(session_key)?;
        if let Some(status) = status {
            candidates.retain(|c| c.status == status);
        }
        candidates.reverse();
        Ok(candidates)
    }

    /// Record pending candidates produced by an out-of-band extraction pass
    /// (e.g. periodic maintenance asking the LLM to extract persona facts).
    pub fn record_extraction_candidates(&self, raw_llm_reply: &str, session_key: &str) -> Result<usize, MemoryError> {
        let candidates = persona::parse_extraction_candidates(raw_llm_reply, session_key);
        for candidate in &candidates {
            self.store.save_persona_candidate(candidate)?;
        }
        Ok(candidates.len())
    }

    pub fn rollback_persona(&self, session_key: &str) -> Result<Option<PersonaRevision>, MemoryError> {
        Ok(self.store.rollback_persona(session_key)?)
    }
}

fn role_label(role: EventRole) -> &'static str {
    match role {
        EventRole::System => "system",
        EventRole::User => "user",
        EventRole::Assistant => "assistant",
        EventRole::Tool => "tool",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> (MemoryService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let svc = MemoryService::open_temp(dir.path()).unwrap();
        (svc, dir)
    }

    #[test]
    fn ensure_session_seeds_genesis_persona() {
        let (svc, _dir) = svc();
        svc.ensure_session("v2:abc").unwrap();
        let revisions = svc.persona_revisions("v2:abc", 10).unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].revision, 0);
    }

    #[test]
    fn ephemeral_session_returns_empty_context() {
        let (svc, _dir) = svc();
        let ctx = svc
            .build_prompt_context(dotagent_core::EPHEMERAL_NO_HISTORY, "hi", 1000)
            .unwrap();
        assert!(ctx.history.is_empty());
    }

    #[test]
    fn events_round_trip_in_order() {
        let (svc, _dir) = svc();
        let turn = Uuid::new_v4();
        svc.append_user_event("v2:abc", turn, 1, "hello").unwrap();
        svc.append_assistant_event("v2:abc", turn, 2, "hi there", vec![]).unwrap();

        let ctx = svc.build_prompt_context("v2:abc", "hello", 10_000).unwrap();
        assert_eq!(ctx.history.len(), 2);
        assert_eq!(ctx.history[0].content, "hello");
        assert_eq!(ctx.history[1].content, "hi there");
    }

    #[test]
    fn force_compact_shrinks_retained_history() {
        let (svc, _dir) = svc();
        let mut seq = 1u64;
        for i in 0..20 {
            let turn = Uuid::new_v4();
            svc.append_user_event("v2:abc", turn, seq, &format!("message number {i} with some padding text"))
                .unwrap();
            seq += 1;
        }

        let before = svc.build_prompt_context("v2:abc", "hi", 100_000).unwrap();
        assert_eq!(before.history.len(), 20);

        svc.force_compact("v2:abc", 50).unwrap();

        let after = svc.build_prompt_context("v2:abc", "hi", 100_000).unwrap();
        assert!(after.history.len() < 20, "compaction should shrink retained history");
        assert!(after.summary.is_some());
    }

    #[test]
    fn trimmed_history_never_begins_with_a_tool_event() {
        let (svc, _dir) = svc();
        let turn = Uuid::new_v4();
        svc.append_user_event("v2:abc", turn, 1, "padding ".repeat(20).trim()).unwrap();
        svc.append_assistant_event("v2:abc", turn, 2, "calling a tool", vec![]).unwrap();
        svc.append_tool_event("v2:abc", turn, 3, "call-1", "read_file", "tool output padding here")
            .unwrap();
        svc.append_assistant_event("v2:abc", turn, 4, "done", vec![]).unwrap();

        // A tiny budget forces the window to cut somewhere inside the
        // tool-call sequence; the leading tool event must be dropped rather
        // than surfaced as the first history item.
        let ctx = svc.build_prompt_context("v2:abc", "hi", 6).unwrap();
        if let Some(first) = ctx.history.first() {
            assert_ne!(first.role, EventRole::Tool);
        }
    }

    #[test]
    fn provider_state_round_trips_per_provider() {
        let (svc, _dir) = svc();
        assert!(svc.get_provider_state("v2:abc", "openrouter").unwrap().is_none());
        svc.set_provider_state("v2:abc", "openrouter", "state-1").unwrap();
        assert_eq!(
            svc.get_provider_state("v2:abc", "openrouter").unwrap().as_deref(),
            Some("state-1")
        );
        assert!(svc.get_provider_state("v2:abc", "ollama").unwrap().is_none());
    }

    #[test]
    fn persona_directive_applies_synchronously() {
        let (svc, _dir) = svc();
        svc.ensure_session("v2:abc").unwrap();
        let report = svc
            .apply_persona_directives("v2:abc", "remember: I like dark roast coffee")
            .unwrap();
        assert_eq!(report.applied.len(), 1);

        let snapshot = svc.persona_snapshot("v2:abc").unwrap().unwrap();
        assert!(snapshot.contains("dark roast"));
    }

    #[test]
    fn persona_rollback_returns_previous_revision() {
        let (svc, _dir) = svc();
        svc.ensure_session("v2:abc").unwrap();
        svc.apply_persona_directives("v2:abc", "remember: likes tea").unwrap();
        svc.apply_persona_directives("v2:abc", "remember: likes coffee").unwrap();

        let before = svc.persona_revisions("v2:abc", 10).unwrap();
        assert_eq!(before.len(), 3);

        let rolled_back_to = svc.rollback_persona("v2:abc").unwrap().unwrap();
        assert_eq!(rolled_back_to.revision, 1);
    }
}
