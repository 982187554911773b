//! Persona record, revisions, and the LLM free-text extraction parser (§9).

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::schema::{CandidateOp, CandidateStatus, PersonaCandidate, PersonaRevision};

/// Render a `/persona show` snapshot.
pub fn render_snapshot(revision: &PersonaRevision) -> String {
    let mut lines = vec![format!("revision: {}", revision.revision)];
    if let Some(name) = &revision.name {
        lines.push(format!("name: {name}"));
    }
    if let Some(style) = &revision.communication_style {
        lines.push(format!("communication style: {style}"));
    }
    if !revision.goals.is_empty() {
        lines.push(format!("goals: {}", revision.goals.join(", ")));
    }
    if !revision.facts.is_empty() {
        lines.push(format!("facts: {}", revision.facts.join(", ")));
    }
    lines.join("\n")
}

/// Apply an accepted candidate to the current revision, producing the next one.
pub fn apply_candidate(current: &PersonaRevision, candidate: &PersonaCandidate) -> PersonaRevision {
    let mut next = current.clone();
    next.revision += 1;
    next.created_at = Utc::now();

    match candidate.field.as_str() {
        "name" => match candidate.op {
            CandidateOp::Delete => next.name = None,
            _ => next.name = Some(candidate.value.clone()),
        },
        "communication_style" => match candidate.op {
            CandidateOp::Delete => next.communication_style = None,
            _ => next.communication_style = Some(candidate.value.clone()),
        },
        "goals" => apply_list_op(&mut next.goals, candidate),
        "facts" => apply_list_op(&mut next.facts, candidate),
        _ => {}
    }
    next
}

fn apply_list_op(list: &mut Vec<String>, candidate: &PersonaCandidate) {
    match candidate.op {
        CandidateOp::Set => {
            list.clear();
            list.push(candidate.value.clone());
        }
        CandidateOp::Append => list.push(candidate.value.clone()),
        CandidateOp::Delete => list.retain(|v| v != &candidate.value),
    }
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    field: String,
    op: String,
    value: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CandidateEnvelope {
    candidates: Vec<RawCandidate>,
}

/// Parse an LLM persona-extraction reply into candidates.
///
/// Accepts three shapes: `{"candidates": [...]}`, a bare `[...]` array, or
/// either wrapped in a markdown ```json fence. Unknown operations (anything
/// other than `set|append|delete`) are dropped; confidence is clamped into
/// `(0, 1]`, defaulting to `0.5` when absent or out of range.
pub fn parse_extraction_candidates(raw: &str, session_key: &str) -> Vec<PersonaCandidate> {
    let unfenced = strip_markdown_fence(raw);
    let trimmed = unfenced.trim();

    let raw_candidates: Vec<RawCandidate> = if let Ok(envelope) =
        serde_json::from_str::<CandidateEnvelope>(trimmed)
    {
        envelope.candidates
    } else if let Ok(bare) = serde_json::from_str::<Vec<RawCandidate>>(trimmed) {
        bare
    } else {
        return Vec::new();
    };

    raw_candidates
        .into_iter()
        .filter_map(|rc| {
            let op = match rc.op.to_lowercase().as_str() {
                "set" => CandidateOp::Set,
                "append" => CandidateOp::Append,
                "delete" => CandidateOp::Delete,
                _ => return None,
            };
            let confidence = rc
                .confidence
                .filter(|c| *c > 0.0 && *c <= 1.0)
                .unwrap_or(0.5);
            Some(PersonaCandidate {
                id: Uuid::new_v4().to_string(),
                session_key: session_key.to_string(),
                field: rc.field,
                op,
                value: rc.value,
                confidence,
                status: CandidateStatus::Pending,
                created_at: Utc::now(),
            })
        })
        .collect()
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap())
}

fn strip_markdown_fence(raw: &str) -> String {
    match fence_regex().captures(raw) {
        Some(caps) => caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        None => raw.to_string(),
    }
}

/// A synchronous, non-LLM directive the user issued inline in their message
/// (e.g. `"remember: I prefer concise answers"`), applied immediately during
/// the turn preamble (§4.D step 5) rather than waiting for async extraction.
#[derive(Debug, Clone)]
pub struct PersonaDirective {
    pub field: &'static str,
    pub op: CandidateOp,
    pub value: String,
}

/// A human-readable report of what synchronous directive handling did this
/// turn, folded into the per-turn policy note.
#[derive(Debug, Clone, Default)]
pub struct PersonaApplyReport {
    pub applied: Vec<String>,
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*(?:remember|note)\s*:\s*(.+)$").unwrap())
}

/// Extract inline `remember:`/`note:` directives from the user's message.
pub fn extract_directives(user_message: &str) -> Vec<PersonaDirective> {
    directive_regex()
        .captures_iter(user_message)
        .filter_map(|caps| {
            let value = caps.get(1)?.as_str().trim().to_string();
            if value.is_empty() {
                return None;
            }
            Some(PersonaDirective {
                field: "facts",
                op: CandidateOp::Append,
                value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_envelope_form() {
        let raw = r#"{"candidates":[{"field":"name","op":"set","value":"Ada","confidence":0.9}]}"#;
        let out = parse_extraction_candidates(raw, "v2:abc");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field, "name");
    }

    #[test]
    fn accepts_bare_array_and_fenced_json() {
        let raw = "```json\n[{\"field\":\"facts\",\"op\":\"append\",\"value\":\"likes tea\"}]\n```";
        let out = parse_extraction_candidates(raw, "v2:abc");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op, CandidateOp::Append);
    }

    #[test]
    fn rejects_unknown_operation() {
        let raw = r#"[{"field":"facts","op":"destroy","value":"x"}]"#;
        assert!(parse_extraction_candidates(raw, "v2:abc").is_empty());
    }

    #[test]
    fn clamps_confidence_into_range() {
        let raw = r#"[{"field":"facts","op":"append","value":"x","confidence":5.0}]"#;
        let out = parse_extraction_candidates(raw, "v2:abc");
        assert_eq!(out[0].confidence, 0.5);
    }

    #[test]
    fn extracts_inline_remember_directive() {
        let directives = extract_directives("remember: I prefer concise answers");
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].value, "I prefer concise answers");
    }
}
