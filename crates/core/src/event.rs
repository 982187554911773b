//! The `Event`/`Turn` data model shared by memory and the orchestrator (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a single message-shaped event in a turn's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A compact description of one tool call the assistant requested, persisted
/// alongside the assistant event that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDescriptor {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// One immutable, append-only record in a session's event log.
///
/// `(session_key, turn_id, seq)` totally orders events within a turn; `seq`
/// starts at 1 with the user event and increases strictly monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub session_key: String,
    pub turn_id: Uuid,
    pub seq: u64,
    pub role: EventRole,
    pub content: String,
    /// Present only on `Tool` events.
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    /// Present only on `Assistant` events that requested tool calls.
    pub tool_calls: Vec<ToolCallDescriptor>,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn user(session_key: impl Into<String>, turn_id: Uuid, seq: u64, content: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            session_key: session_key.into(),
            turn_id,
            seq,
            role: EventRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn assistant(
        session_key: impl Into<String>,
        turn_id: Uuid,
        seq: u64,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallDescriptor>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            session_key: session_key.into(),
            turn_id,
            seq,
            role: EventRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls,
            occurred_at: Utc::now(),
        }
    }

    pub fn tool(
        session_key: impl Into<String>,
        turn_id: Uuid,
        seq: u64,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            session_key: session_key.into(),
            turn_id,
            seq,
            role: EventRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            tool_calls: Vec::new(),
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_event_has_no_tool_fields() {
        let turn = Uuid::new_v4();
        let ev = Event::user("v2:abc", turn, 1, "hello");
        assert_eq!(ev.seq, 1);
        assert!(ev.tool_call_id.is_none());
        assert!(ev.tool_calls.is_empty());
        assert_eq!(ev.role, EventRole::User);
    }

    #[test]
    fn tool_event_carries_call_id_and_name() {
        let turn = Uuid::new_v4();
        let ev = Event::tool("v2:abc", turn, 3, "call-1", "read_file", "contents");
        assert_eq!(ev.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(ev.tool_name.as_deref(), Some("read_file"));
    }

    #[test]
    fn roundtrips_through_json() {
        let turn = Uuid::new_v4();
        let ev = Event::assistant(
            "v2:abc",
            turn,
            2,
            "",
            vec![ToolCallDescriptor {
                tool_call_id: "call-1".into(),
                tool_name: "web_search".into(),
                arguments: serde_json::json!({"query": "rust"}),
            }],
        );
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].tool_name, "web_search");
    }
}
