//! The Message Bus: bounded inbound/outbound queues with drop counters (§2,
//! §5, §6), plus the `ChannelManager` that tracks enabled channels and the
//! last-used channel (§6.1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// Channel names the outbound dispatcher must never deliver to an external
/// adapter (§6, Glossary: "Internal channel").
pub const INTERNAL_CHANNELS: [&str; 3] = ["system", "cli", "subagent"];

pub fn is_internal_channel(channel: &str) -> bool {
    INTERNAL_CHANNELS.contains(&channel)
}

/// A message arriving from a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
}

/// A reply the orchestrator hands back to a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

/// Bounded FIFOs between channel adapters and the orchestrator. When a queue
/// is full the producer drops the message and increments a counter rather
/// than blocking (§5).
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEnvelope>>>,
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundEnvelope>>>,
    dropped_inbound: AtomicU64,
    dropped_outbound: AtomicU64,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            dropped_inbound: AtomicU64::new(0),
            dropped_outbound: AtomicU64::new(0),
        }
    }

    /// Enqueue an inbound message. Returns `false` (and increments the drop
    /// counter) if the queue is full rather than blocking the adapter.
    pub fn publish_inbound(&self, envelope: InboundEnvelope) -> bool {
        match self.inbound_tx.try_send(envelope) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("inbound bus full, dropping message");
                false
            }
        }
    }

    pub fn publish_outbound(&self, envelope: OutboundEnvelope) -> bool {
        let channel = envelope.channel.clone();
        match self.outbound_tx.try_send(envelope) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%channel, "outbound bus full, dropping message");
                false
            }
        }
    }

    /// Take ownership of the inbound receiver. Only the single orchestrator
    /// worker should call this, and only once.
    pub async fn take_inbound_receiver(&self) -> Option<mpsc::Receiver<InboundEnvelope>> {
        self.inbound_rx.lock().await.take()
    }

    /// Take ownership of the outbound receiver. Only the single outbound
    /// dispatcher worker should call this, and only once.
    pub async fn take_outbound_receiver(&self) -> Option<mpsc::Receiver<OutboundEnvelope>> {
        self.outbound_rx.lock().await.take()
    }

    pub fn dropped_inbound_count(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    pub fn dropped_outbound_count(&self) -> u64 {
        self.dropped_outbound.load(Ordering::Relaxed)
    }
}

/// A concrete delivery mechanism for one channel's outbound replies (§6.1).
/// Implemented once per channel adapter (CLI, Discord) and registered with
/// the outbound dispatch worker.
#[async_trait::async_trait]
pub trait ChannelSink: Send + Sync {
    fn channel_name(&self) -> &str;
    async fn deliver(&self, envelope: &OutboundEnvelope) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Tracks the enabled channel set and the last-used channel, guarded by its
/// own `RwLock` per the global-mutable-state guidance of §9.
pub struct ChannelManager {
    enabled: Vec<String>,
    last_used: RwLock<Option<String>>,
}

impl ChannelManager {
    pub fn new(enabled: Vec<String>) -> Self {
        Self {
            enabled,
            last_used: RwLock::new(None),
        }
    }

    pub fn enabled_channels(&self) -> &[String] {
        &self.enabled
    }

    pub fn is_enabled(&self, channel: &str) -> bool {
        self.enabled.iter().any(|c| c == channel)
    }

    /// Record the last-used channel, skipping internal channels (§4.D preamble
    /// step 1).
    pub fn record_last_used(&self, channel: &str) {
        if is_internal_channel(channel) {
            return;
        }
        *self.last_used.write().unwrap() = Some(channel.to_string());
    }

    pub fn last_used(&self) -> Option<String> {
        self.last_used.read().unwrap().clone()
    }

    /// Validate a `/switch channel to <name>` request against the enabled set.
    pub fn switch_channel(&self, name: &str) -> Result<(), ChannelError> {
        if self.is_enabled(name) {
            Ok(())
        } else {
            Err(ChannelError::UnknownChannel(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(channel: &str) -> InboundEnvelope {
        InboundEnvelope {
            channel: channel.to_string(),
            sender_id: "user-1".to_string(),
            chat_id: "chat-1".to_string(),
            content: "hi".to_string(),
            media: Vec::new(),
            session_key: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn publish_and_receive_inbound() {
        let bus = MessageBus::new(4);
        assert!(bus.publish_inbound(envelope("cli")));
        let mut rx = bus.take_inbound_receiver().await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, "cli");
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let bus = MessageBus::new(1);
        assert!(bus.publish_inbound(envelope("cli")));
        assert!(!bus.publish_inbound(envelope("cli")));
        assert_eq!(bus.dropped_inbound_count(), 1);
    }

    #[test]
    fn internal_channels_are_recognized() {
        assert!(is_internal_channel("system"));
        assert!(is_internal_channel("subagent"));
        assert!(!is_internal_channel("discord"));
    }

    #[test]
    fn channel_manager_ignores_internal_channels_for_last_used() {
        let manager = ChannelManager::new(vec!["cli".into(), "discord".into()]);
        manager.record_last_used("system");
        assert_eq!(manager.last_used(), None);
        manager.record_last_used("discord");
        assert_eq!(manager.last_used().as_deref(), Some("discord"));
    }

    #[test]
    fn switch_channel_rejects_unknown_names() {
        let manager = ChannelManager::new(vec!["cli".into()]);
        assert!(manager.switch_channel("cli").is_ok());
        assert!(manager.switch_channel("telegram").is_err());
    }
}
