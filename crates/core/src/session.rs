//! Deterministic session-key derivation (§4.A of the design).

use sha1::{Digest, Sha1};
use thiserror::Error;

/// Sentinel session key used for `NoHistory` turns; never persisted.
pub const EPHEMERAL_NO_HISTORY: &str = "ephemeral:no_history";

const V2_PREFIX: &str = "v2:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("missing session: no explicit key and identity fields are incomplete")]
    MissingSession,
}

/// Derive (or pass through) a session key from identity fields.
///
/// - If `explicit` already carries the `v2:` prefix, it is returned verbatim.
/// - Otherwise, if all four identity fields are non-empty after trimming, the
///   canonical v2 key is derived and returned -- even when `explicit` is a
///   non-empty legacy key. The derived key always wins over a stale legacy
///   key when identity is sufficient to compute one (see SPEC_FULL.md §9.1).
/// - If identity is incomplete, a non-empty `explicit` is returned as a legacy
///   fallback.
/// - If both are empty, resolution fails with `MissingSession`.
pub fn resolve_session_key(
    explicit: Option<&str>,
    workspace: &str,
    channel: &str,
    conversation: &str,
    actor: &str,
) -> Result<String, SessionError> {
    if let Some(explicit) = explicit {
        if explicit.starts_with(V2_PREFIX) {
            return Ok(explicit.to_string());
        }
    }

    let workspace = workspace.trim();
    let channel = channel.trim();
    let conversation = conversation.trim();
    let actor = actor.trim();

    if !workspace.is_empty() && !channel.is_empty() && !conversation.is_empty() && !actor.is_empty()
    {
        let canonical = format!(
            "{}|{}|{}|{}",
            workspace.to_lowercase(),
            channel.to_lowercase(),
            conversation,
            actor
        );
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let hex128 = hex_prefix(&digest, 16);
        return Ok(format!("{V2_PREFIX}{hex128}"));
    }

    match explicit {
        Some(explicit) if !explicit.is_empty() => Ok(explicit.to_string()),
        _ => Err(SessionError::MissingSession),
    }
}

/// Derive the workspace namespace used to scope on-disk state:
/// `"ws-" + hex64(sha1(lower(trim(path))))`, falling back to
/// `"default-workspace"` when `path` is empty.
pub fn workspace_namespace(path: &str) -> String {
    let trimmed = path.trim();
    let input = if trimmed.is_empty() {
        "default-workspace"
    } else {
        trimmed
    };
    let mut hasher = Sha1::new();
    hasher.update(input.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    format!("ws-{}", hex_prefix(&digest, 8))
}

/// Hex-encode the first `n` bytes of a digest (n=16 -> 128 bits, n=8 -> 64 bits).
fn hex_prefix(digest: &[u8], n: usize) -> String {
    digest[..n].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = resolve_session_key(None, "Workspace", "discord", "chat-1", "user-1").unwrap();
        let b = resolve_session_key(None, "workspace", "DISCORD", "chat-1", "user-1").unwrap();
        assert_eq!(a, b, "workspace/channel are case-insensitive");
        assert!(a.starts_with(V2_PREFIX));
    }

    #[test]
    fn different_actors_map_to_different_keys() {
        let a = resolve_session_key(None, "ws", "discord", "chat-1", "alice").unwrap();
        let b = resolve_session_key(None, "ws", "discord", "chat-1", "bob").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn different_conversations_map_to_different_keys() {
        let a = resolve_session_key(None, "ws", "discord", "chat-1", "alice").unwrap();
        let b = resolve_session_key(None, "ws", "discord", "chat-2", "alice").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn explicit_v2_key_is_returned_unchanged() {
        let explicit = "v2:deadbeefdeadbeefdeadbeefdeadbeef";
        let resolved =
            resolve_session_key(Some(explicit), "ws", "discord", "chat-1", "alice").unwrap();
        assert_eq!(resolved, explicit);
    }

    #[test]
    fn derived_key_wins_over_legacy_explicit_when_identity_is_sufficient() {
        let legacy = "legacy-key-123";
        let resolved =
            resolve_session_key(Some(legacy), "ws", "discord", "chat-1", "alice").unwrap();
        assert_ne!(resolved, legacy);
        assert!(resolved.starts_with(V2_PREFIX));
    }

    #[test]
    fn legacy_key_is_fallback_when_identity_incomplete() {
        let legacy = "legacy-key-123";
        let resolved = resolve_session_key(Some(legacy), "", "discord", "chat-1", "alice").unwrap();
        assert_eq!(resolved, legacy);
    }

    #[test]
    fn missing_session_when_both_absent() {
        let err = resolve_session_key(None, "", "discord", "chat-1", "alice").unwrap_err();
        assert_eq!(err, SessionError::MissingSession);
    }

    #[test]
    fn missing_session_when_explicit_empty_string() {
        let err = resolve_session_key(Some(""), "", "", "", "").unwrap_err();
        assert_eq!(err, SessionError::MissingSession);
    }

    #[test]
    fn workspace_namespace_is_deterministic_and_case_insensitive() {
        let a = workspace_namespace("/home/user/My Workspace");
        let b = workspace_namespace("/home/user/my workspace");
        assert_eq!(a, b);
        assert!(a.starts_with("ws-"));
        assert_eq!(a.len(), "ws-".len() + 16);
    }

    #[test]
    fn workspace_namespace_falls_back_on_empty_path() {
        let default_ns = workspace_namespace("");
        assert_eq!(default_ns, workspace_namespace("default-workspace"));
    }
}
