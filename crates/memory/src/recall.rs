//! Lexical recall scoring over events folded into the durable summary.
//!
//! Grounded on the donor's tier/recency/lexical hybrid scorer, simplified to
//! the two signals that remain meaningful once entries are plain `Event`
//! records rather than tiered memory entries: lexical overlap with the
//! current message, and recency.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dotagent_core::Event;

/// Build a recall prompt block from events that are no longer in the
/// retained history window (already folded into the durable summary).
///
/// Returns `None` when there is nothing worth recalling.
pub fn build_recall_prompt(folded_events: &[Event], query: &str, limit: usize) -> Option<String> {
    if folded_events.is_empty() || query.trim().is_empty() {
        return None;
    }

    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return None;
    }

    let now = Utc::now();
    let mut ranked: Vec<(&Event, f32)> = folded_events
        .iter()
        .filter(|e| !e.content.trim().is_empty())
        .map(|e| (e, score(e, &query_terms, now)))
        .filter(|(_, score)| *score > 0.0)
        .collect();

    ranked.sort_by(|(_, a), (_, b)| b.total_cmp(a));
    let picked: Vec<&str> = ranked
        .into_iter()
        .take(limit)
        .map(|(e, _)| e.content.as_str())
        .collect();

    if picked.is_empty() {
        return None;
    }

    Some(
        picked
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn score(event: &Event, query_terms: &BTreeSet<String>, now: DateTime<Utc>) -> f32 {
    let entry_terms = tokenize(&event.content);
    let overlap = entry_terms.intersection(query_terms).count();
    let lexical = if entry_terms.is_empty() {
        0.0
    } else {
        overlap as f32 / entry_terms.len().max(query_terms.len()) as f32
    };

    let age_days = (now - event.occurred_at).num_seconds().max(0) as f32 / 86_400.0;
    let recency = (1.0 - (age_days / 30.0)).clamp(0.0, 1.0);

    lexical * 0.75 + recency * 0.25
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ev(content: &str) -> Event {
        Event::user("v2:abc", Uuid::new_v4(), 1, content)
    }

    #[test]
    fn empty_query_yields_nothing() {
        assert!(build_recall_prompt(&[ev("hello world")], "", 5).is_none());
    }

    #[test]
    fn picks_lexically_overlapping_events() {
        let events = vec![ev("my favorite language is rust"), ev("the weather today is sunny")];
        let prompt = build_recall_prompt(&events, "tell me about rust programming", 5).unwrap();
        assert!(prompt.contains("rust"));
        assert!(!prompt.contains("weather"));
    }
}
