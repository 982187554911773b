//! Session identity and the shared event/turn types every other crate builds on.
//!
//! This crate has no dependency on policy, memory, or the provider — it is the
//! leaf of the dependency graph. `SessionKey` derivation is deterministic and
//! pure so it can be unit tested in isolation from everything that uses it.

pub mod event;
pub mod session;

pub use event::{Event, EventRole, ToolCallDescriptor};
pub use session::{resolve_session_key, workspace_namespace, SessionError, EPHEMERAL_NO_HISTORY};
