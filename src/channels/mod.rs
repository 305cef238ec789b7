//! Chat transport adapters
//!
//! An adapter implements [`Channel`] for outbound traffic and delivers
//! [`ChannelEvent`]s over an mpsc receiver for inbound traffic.

mod discord;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use discord::{DiscordChannel, DiscordExecutor};

use crate::Result;

/// Longest message Discord accepts, in characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

/// A message observed in a channel
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Message identifier (platform-specific)
    pub id: String,

    /// Channel identifier
    pub channel_id: String,

    /// Channel display name, when the platform exposes one
    pub channel_name: Option<String>,

    /// Server the channel belongs to; `None` for direct messages
    pub guild_id: Option<String>,

    pub author_id: String,
    pub author_name: String,

    /// Whether the author is a bot account
    pub author_is_bot: bool,

    /// Message text
    pub content: String,

    /// When the message was sent
    pub timestamp: DateTime<Utc>,

    /// User ids explicitly mentioned by the platform
    pub mentions: Vec<String>,
}

impl IncomingMessage {
    /// Whether `user_id` is explicitly mentioned
    #[must_use]
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|m| m == user_id)
    }
}

/// Inbound event from a transport
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A message was posted
    Message(IncomingMessage),

    /// The session is up; carries the agent's own identity
    Ready { agent_id: String, agent_name: String },

    /// A channel was deleted
    ChannelDeleted { channel_id: String },
}

/// A message to send to a channel
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Channel identifier
    pub channel_id: String,

    /// Message content (plain text, may contain markdown)
    pub content: String,

    /// Optional reply-to message ID
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    /// Create a simple `text` message
    #[must_use]
    pub const fn text(channel_id: String, content: String) -> Self {
        Self {
            channel_id,
            content,
            reply_to: None,
        }
    }

    /// Create a `reply` message
    #[must_use]
    pub const fn reply(channel_id: String, content: String, reply_to: String) -> Self {
        Self {
            channel_id,
            content,
            reply_to: Some(reply_to),
        }
    }
}

/// Split `content` into pieces of at most `limit` characters
///
/// Prefers to break on a newline, then on a space; falls back to a hard cut.
#[must_use]
pub fn chunk_message(content: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = content.trim();

    while rest.chars().count() > limit {
        let hard = rest
            .char_indices()
            .nth(limit)
            .map_or(rest.len(), |(i, _)| i);
        let window = &rest[..hard];
        let cut = if rest[hard..].starts_with(char::is_whitespace) {
            hard
        } else {
            window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .filter(|&i| i > 0)
                .unwrap_or(hard)
        };

        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Trait for chat transport adapters
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name
    fn name(&self) -> &'static str;

    /// Connect to the transport
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from the transport
    async fn disconnect(&mut self) -> Result<()>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Send typing indicator to show the agent is working
    ///
    /// Default implementation is a no-op for transports without one
    async fn send_typing(&self, _channel_id: &str) -> Result<()> {
        Ok(())
    }
}
