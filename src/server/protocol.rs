//! Chat wire protocol
//!
//! Defines what clients submit over the socket and what the broker sends back.
//! Inbound frames are JSON objects carrying a `chat_message` field (the shape
//! produced by the chat form); any other fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while interpreting an inbound chat frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid chat payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Chat message is empty")]
    EmptyMessage,
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Normalization
// ============================================================================

/// Collapse embedded newlines to spaces and trim surrounding whitespace
///
/// Applied to every inbound frame before it is parsed, so a multi-line JSON
/// document becomes a single line.
pub fn normalize(raw: &str) -> String {
    raw.replace('\n', " ").trim().to_string()
}

// ============================================================================
// Client Messages
// ============================================================================

/// A chat line submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSubmission {
    pub chat_message: String,
}

impl ChatSubmission {
    /// Parse a normalized frame
    ///
    /// The message text is trimmed; a blank message is rejected.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let submission: Self = serde_json::from_str(json)?;
        let text = submission.chat_message.trim();
        if text.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        Ok(Self {
            chat_message: text.to_string(),
        })
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from the broker to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A chat line from some member, possibly the receiver itself
    ChatMessage {
        sender: String,
        text: String,
        sent_at: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn chat(
        sender: impl Into<String>,
        text: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self::ChatMessage {
            sender: sender.into(),
            text: text.into(),
            sent_at,
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server message from JSON (primarily for testing)
    #[allow(dead_code)]
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
