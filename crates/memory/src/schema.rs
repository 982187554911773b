//! Supplemented types persisted by the memory service (§3.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The compaction target written by force-compact and periodic maintenance.
/// Never overlaps with retained events still present verbatim in history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DurableSummaryRecord {
    pub text: String,
    /// Number of oldest events (in session order) already folded into `text`.
    pub covers_through_count: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One state id a stateful provider handed back for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStateRecord {
    pub session_key: String,
    pub provider: String,
    pub state_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Status of a persona candidate awaiting (or having received) a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Operation a persona candidate requests against the persona record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateOp {
    Set,
    Append,
    Delete,
}

/// A single free-text extraction candidate before it becomes a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaCandidate {
    pub id: String,
    pub session_key: String,
    pub field: String,
    pub op: CandidateOp,
    pub value: String,
    /// Clamped to `(0, 1]` (§9 Persona extraction).
    pub confidence: f32,
    pub status: CandidateStatus,
    pub created_at: DateTime<Utc>,
}

/// One accepted mutation of a session's persona record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaRevision {
    pub session_key: String,
    pub revision: u64,
    pub name: Option<String>,
    pub communication_style: Option<String>,
    pub goals: Vec<String>,
    pub facts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl PersonaRevision {
    pub fn genesis(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            revision: 0,
            name: None,
            communication_style: None,
            goals: Vec::new(),
            facts: Vec::new(),
            created_at: Utc::now(),
        }
    }
}
