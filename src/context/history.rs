//! In-process message history per channel

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::channels::IncomingMessage;

/// One observed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub message_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Written by the agent itself
    pub from_agent: bool,
}

impl HistoryMessage {
    /// Capture an incoming message
    #[must_use]
    pub fn from_incoming(message: &IncomingMessage, from_agent: bool) -> Self {
        Self {
            message_id: message.id.clone(),
            author_id: message.author_id.clone(),
            author_name: message.author_name.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            from_agent,
        }
    }

    /// Render as a transcript line
    #[must_use]
    pub fn render(&self) -> String {
        format!("{} ({}): {}", self.author_name, self.author_id, self.content)
    }
}

/// Bounded ring of recent messages for every channel
#[derive(Debug)]
pub struct ChannelHistory {
    capacity: usize,
    channels: Mutex<HashMap<String, VecDeque<HistoryMessage>>>,
}

impl ChannelHistory {
    /// Keep at most `capacity` messages per channel
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Append a message, evicting the oldest past capacity
    pub fn record(&self, channel_id: &str, message: HistoryMessage) {
        self.record_window(channel_id, message, 0);
    }

    /// Append a message and return the last `n` messages ending with it
    ///
    /// Later messages in the same channel never leak into the returned
    /// window, however long the caller waits before using it.
    pub fn record_window(
        &self,
        channel_id: &str,
        message: HistoryMessage,
        n: usize,
    ) -> Vec<HistoryMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = channels.entry(channel_id.to_string()).or_default();
        ring.push_back(message);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Last `n` messages, oldest first
    #[must_use]
    pub fn window(&self, channel_id: &str, n: usize) -> Vec<HistoryMessage> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(channel_id).map_or_else(Vec::new, |ring| {
            let skip = ring.len().saturating_sub(n);
            ring.iter().skip(skip).cloned().collect()
        })
    }

    /// Drop a channel's history
    pub fn forget(&self, channel_id: &str) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel_id);
    }
}
