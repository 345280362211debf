//! Domain types persisted in the conversation store.

use serde::{Deserialize, Serialize};

/// A single chat message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub conversation_id: String,
    /// Position within the conversation, starting at 0.
    pub seq: u64,
    /// "user", "assistant", "system", ...
    pub role: String,
    pub content: String,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

impl StoredMessage {
    /// Composite table key; zero-padded so keys sort by sequence.
    pub fn table_key(&self) -> String {
        format!("{}:{:010}", self.conversation_id, self.seq)
    }
}

/// Per-conversation summary record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub message_count: u64,
    pub updated_at: u64,
}

/// Outcome of an integrity check against the database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityReport {
    /// The on-disk structure is self-consistent.
    Ok,
    /// Anything else, with a diagnostic.
    Damaged(String),
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        matches!(self, IntegrityReport::Ok)
    }
}
