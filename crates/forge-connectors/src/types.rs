//! Platform-agnostic connector contract and message types.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default chunk limit for outbound text. Platforms with tighter limits
/// pass their own to [`chunk_text`].
pub const CHUNK_LIMIT: usize = 4096;

/// Connector-level failure. Sends are retried with backoff by the router;
/// after the retry cap the message is logged and dropped.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("connector unavailable: {0}")]
    Unavailable(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("invalid channel {0:?}")]
    InvalidChannel(String),
}

/// Media classification for `send_media`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
        }
    }
}

/// Interactive button attached to an outbound message on platforms that
/// support them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub label: String,
    pub action: String,
    pub agent_id: String,
}

impl ActionButton {
    pub fn new(label: &str, action: &str, agent_id: &str) -> Self {
        Self {
            label: label.to_string(),
            action: action.to_string(),
            agent_id: agent_id.to_string(),
        }
    }
}

/// Channel descriptor for the binding UX.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub kind: String,
}

/// An inbound attachment already staged to a local temp path by the
/// connector. The router moves it into the target workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub path: PathBuf,
}

/// A pressed action button, round-tripped through the platform's callback
/// mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonCallback {
    pub action: String,
    pub agent_id: String,
}

/// Platform-agnostic incoming message pushed into the router.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub connector_id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub button_callback: Option<ButtonCallback>,
}

/// Platform-agnostic outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub text: String,
    pub buttons: Vec<ActionButton>,
}

impl OutboundMessage {
    pub fn text(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            text: text.into(),
            buttons: Vec::new(),
        }
    }
}

/// The uniform contract every chat platform implements.
///
/// `start` installs the inbound sender and begins polling/listening;
/// both lifecycle calls are idempotent.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), PlatformError>;

    async fn stop(&self) -> Result<(), PlatformError>;

    async fn send_text(&self, message: &OutboundMessage) -> Result<(), PlatformError>;

    async fn send_media(
        &self,
        channel_id: &str,
        path: &Path,
        kind: MediaKind,
    ) -> Result<(), PlatformError>;

    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, PlatformError>;

    async fn validate_channel(&self, channel_id: &str) -> Result<bool, PlatformError>;
}

// ---------------------------------------------------------------------------
// Text chunking
// ---------------------------------------------------------------------------

/// Splits text into chunks that fit within `limit`, preferring paragraph
/// breaks, then line breaks, then sentence ends, then a hard split.
/// Multi-part output gets `[i/N]` indicators.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let indicator_reserve = 8;
    let effective_limit = limit.saturating_sub(indicator_reserve).max(1);

    let mut chunks: Vec<String> = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= effective_limit {
            chunks.push(remaining.to_string());
            break;
        }
        let split_pos = find_split_point(remaining, effective_limit);
        chunks.push(remaining[..split_pos].trim_end().to_string());
        remaining = remaining[split_pos..].trim_start();
    }

    if chunks.len() > 1 {
        let total = chunks.len();
        chunks = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| format!("{chunk} [{}/{total}]", i + 1))
            .collect();
    }
    chunks
}

fn find_split_point(text: &str, limit: usize) -> usize {
    let window = floor_char_boundary(text, limit);
    let head = &text[..window];

    if let Some(pos) = head.rfind("\n\n") {
        if pos > limit / 4 {
            return pos + 2;
        }
    }
    if let Some(pos) = head.rfind('\n') {
        if pos > limit / 4 {
            return pos + 1;
        }
    }
    if let Some(pos) = head.rfind(". ") {
        if pos > limit / 4 {
            return pos + 2;
        }
    }
    window
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn chunks_carry_indicators() {
        let text = "para one\n\npara two\n\npara three";
        let chunks = chunk_text(text, 16);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.ends_with(&format!("[{}/{}]", i + 1, chunks.len())));
        }
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(40), "b".repeat(40));
        let chunks = chunk_text(&text, 60);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains(&"a".repeat(40)));
        assert!(chunks[1].contains(&"b".repeat(40)));
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "é".repeat(100);
        let chunks = chunk_text(&text, 21);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.is_char_boundary(0));
        }
    }
}
