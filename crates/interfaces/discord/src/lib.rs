//! The Discord channel adapter (§6.1): thin REST glue, channel name
//! `"discord"`. Outbound replies POST to the channel-message endpoint;
//! inbound messages are picked up by a minimal poll loop against the same
//! endpoint rather than a gateway websocket, which is out of scope here.

use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use dotagent_bus::{ChannelSink, InboundEnvelope, MessageBus, OutboundEnvelope};

const CHANNEL_NAME: &str = "discord";
const POLL_INTERVAL: Duration = Duration::from_millis(2500);
const MAX_MESSAGE_CHARS: usize = 1900;
const API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    author: DiscordAuthor,
    content: String,
}

#[derive(Debug, Deserialize)]
struct DiscordAuthor {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    content: &'a str,
}

/// Polls and posts to one Discord text channel via the REST API.
#[derive(Clone)]
pub struct DiscordAdapter {
    client: Client,
    token: String,
    channel_id: String,
}

impl DiscordAdapter {
    pub fn new(token: String, channel_id: String) -> Self {
        Self {
            client: Client::new(),
            token,
            channel_id,
        }
    }

    fn messages_url(&self) -> String {
        format!("{API_BASE}/channels/{}/messages", self.channel_id)
    }

    /// Runs the inbound poll loop forever, publishing each non-bot message
    /// to the bus. Seeds its cursor from the channel's current tail so it
    /// never replays history on startup.
    pub async fn poll_inbound(&self, bus: std::sync::Arc<MessageBus>) -> Result<()> {
        if self.token.trim().is_empty() {
            bail!("Discord bot token is empty");
        }
        if self.channel_id.trim().is_empty() {
            bail!("Discord channel id is empty");
        }

        let mut after = self.seed_cursor().await.unwrap_or(None);

        loop {
            match self.fetch_messages(after.as_deref()).await {
                Ok(mut messages) => {
                    // The API returns newest-first; replay oldest-first so
                    // `after` always advances to the true latest id.
                    messages.reverse();
                    for message in messages {
                        after = Some(message.id.clone());
                        if message.author.bot {
                            continue;
                        }
                        bus.publish_inbound(InboundEnvelope {
                            channel: CHANNEL_NAME.to_string(),
                            sender_id: message.author.id,
                            chat_id: self.channel_id.clone(),
                            content: message.content,
                            media: Vec::new(),
                            session_key: None,
                            metadata: Default::default(),
                        });
                    }
                }
                Err(err) => {
                    let err_str = err.to_string();
                    if err_str.contains("429") {
                        tracing::warn!("discord rate limited; backing off 10s");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        continue;
                    }
                    tracing::warn!(%err, "discord poll failed");
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn seed_cursor(&self) -> Result<Option<String>> {
        let messages = self.fetch_messages(None).await?;
        Ok(messages.first().map(|m| m.id.clone()))
    }

    async fn fetch_messages(&self, after: Option<&str>) -> Result<Vec<DiscordMessage>> {
        let mut request = self
            .client
            .get(self.messages_url())
            .header("Authorization", format!("Bot {}", self.token))
            .query(&[("limit", "20")]);
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn send_message(&self, content: &str) -> Result<()> {
        for chunk in chunk_message(content, MAX_MESSAGE_CHARS) {
            self.client
                .post(self.messages_url())
                .header("Authorization", format!("Bot {}", self.token))
                .json(&SendMessageRequest { content: &chunk })
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelSink for DiscordAdapter {
    fn channel_name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn deliver(&self, envelope: &OutboundEnvelope) -> Result<()> {
        self.send_message(&envelope.content).await
    }
}

/// Splits long replies on line boundaries so no chunk exceeds Discord's
/// per-message length limit.
fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count() + 1;
        if current_len > 0 && current_len + line_len > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        if line_len > max_chars {
            for piece in hard_split(line, max_chars) {
                chunks.push(piece);
            }
            continue;
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

/// Splits a single line with no newlines into `max_chars`-sized pieces on
/// char boundaries, for lines too long to fit `chunk_message`'s line-based
/// packing (a long URL or unbroken JSON blob, for instance).
fn hard_split(line: &str, max_chars: usize) -> Vec<String> {
    line.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_a_single_chunk() {
        assert_eq!(chunk_message("hello", 1900), vec!["hello".to_string()]);
    }

    #[test]
    fn long_message_splits_on_line_boundaries() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = chunk_message(&text, 12);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(10));
        assert_eq!(chunks[1], "b".repeat(10));
    }

    #[test]
    fn a_single_overlong_line_is_hard_split() {
        let text = "a".repeat(30);
        let chunks = chunk_message(&text, 12);
        assert!(chunks.iter().all(|c| c.chars().count() <= 12));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn adapter_reports_its_channel_name() {
        let adapter = DiscordAdapter::new("token".to_string(), "123".to_string());
        assert_eq!(adapter.channel_name(), "discord");
    }
}
