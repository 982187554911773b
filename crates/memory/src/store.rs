//! redb-backed persistence for `<workspace>/state/memory.db` (§6).
//!
//! Tables are keyed so that a lexicographic scan returns records in the
//! order the spec needs: events sort by `(session_key, occurred_at_nanos,
//! seq)` so a prefix scan over a session yields its event log in order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dotagent_core::Event;
use redb::{Database, ReadableTable, TableDefinition};

use crate::schema::{DurableSummaryRecord, PersonaCandidate, PersonaRevision, ProviderStateRecord};

const EVENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
const SUMMARY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("durable_summary");
const PROVIDER_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("provider_state");
const PERSONA_REVISIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("persona_revisions");
const PERSONA_CANDIDATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("persona_candidates");

pub struct MemoryStore {
    db: Database,
    #[allow(dead_code)]
    path: PathBuf,
}

fn event_key(event: &Event) -> String {
    format!(
        "{}|{:020}|{:010}",
        event.session_key,
        event.occurred_at.timestamp_nanos_opt().unwrap_or(0),
        event.seq
    )
}

impl MemoryStore {
    /// Open or create the database at `path`, ensuring every table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)
            .with_context(|| format!("opening memory store at {}", path.display()))?;
        {
            let tx = db.begin_write()?;
            tx.open_table(EVENTS_TABLE)?;
            tx.open_table(SUMMARY_TABLE)?;
            tx.open_table(PROVIDER_STATE_TABLE)?;
            tx.open_table(PERSONA_REVISIONS_TABLE)?;
            tx.open_table(PERSONA_CANDIDATES_TABLE)?;
            tx.commit()?;
        }
        Ok(Self { db, path })
    }

    /// In-memory-file store for tests; never persisted to disk.
    pub fn open_temp(dir: &Path) -> Result<Self> {
        Self::open(dir.join("memory.db"))
    }

    pub fn append_event(&self, event: &Event) -> Result<()> {
        let key = event_key(event);
        let bytes = serde_json::to_vec(event)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(EVENTS_TABLE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All events for a session, oldest first.
    pub fn load_events(&self, session_key: &str) -> Result<Vec<Event>> {
        let prefix = format!("{session_key}|");
        let tx = self.db.begin_read()?;
        let table = tx.open_table(EVENTS_TABLE)?;
        let mut out = Vec::new();
        for row in table.range(prefix.as_str()..)? {
            let (k, v) = row?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    pub fn load_summary(&self, session_key: &str) -> Result<Option<DurableSummaryRecord>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(SUMMARY_TABLE)?;
        match table.get(session_key)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn save_summary(&self, session_key: &str, record: &DurableSummaryRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(SUMMARY_TABLE)?;
            table.insert(session_key, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_provider_state(&self, session_key: &str, provider: &str) -> Result<Option<String>> {
        let key = format!("{session_key}|{provider}");
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PROVIDER_STATE_TABLE)?;
        match table.get(key.as_str())? {
            Some(v) => {
                let record: ProviderStateRecord = serde_json::from_slice(v.value())?;
                Ok(Some(record.state_id))
            }
            None => Ok(None),
        }
    }

    pub fn save_provider_state(&self, record: &ProviderStateRecord) -> Result<()> {
        let key = format!("{}|{}", record.session_key, record.provider);
        let bytes = serde_json::to_vec(record)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(PROVIDER_STATE_TABLE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_persona_revisions(&self, session_key: &str) -> Result<Vec<PersonaRevision>> {
        let prefix = format!("{session_key}|");
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PERSONA_REVISIONS_TABLE)?;
        let mut out = Vec::new();
        for row in table.range(prefix.as_str()..)? {
            let (k, v) = row?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    pub fn append_persona_revision(&self, revision: &PersonaRevision) -> Result<()> {
        let key = format!("{}|{:010}", revision.session_key, revision.revision);
        let bytes = serde_json::to_vec(revision)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(PERSONA_REVISIONS_TABLE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop the most recent revision, returning the one that is now current
    /// (or `None` if only the genesis revision remains).
    pub fn rollback_persona(&self, session_key: &str) -> Result<Option<PersonaRevision>> {
        let mut revisions = self.load_persona_revisions(session_key)?;
        if revisions.len() <= 1 {
            return Ok(revisions.pop());
        }
        let dropped = revisions.pop().unwrap();
        let key = format!("{}|{:010}", session_key, dropped.revision);
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(PERSONA_REVISIONS_TABLE)?;
            table.remove(key.as_str())?;
        }
        tx.commit()?;
        Ok(revisions.pop())
    }

    pub fn load_persona_candidates(&self, session_key: &str) -> Result<Vec<PersonaCandidate>> {
        let prefix = format!("{session_key}|");
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PERSONA_CANDIDATES_TABLE)?;
        let mut out = Vec::new();
        for row in table.range(prefix.as_str()..)? {
            let (k, v) = row?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    pub fn save_persona_candidate(&self, candidate: &PersonaCandidate) -> Result<()> {
        let key = format!("{}|{}", candidate.session_key, candidate.id);
        let bytes = serde_json::to_vec(candidate)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(PERSONA_CANDIDATES_TABLE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }
}
