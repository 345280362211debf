//! redb table definitions for the conversation store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Messages keyed by `{conversation_id}:{seq}` (seq zero-padded).
pub const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// Conversation summaries keyed by `{conversation_id}`.
pub const CONVERSATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");

/// Every table, in the order a rebuild copies them.
pub const ALL_TABLES: [TableDefinition<'static, &'static str, &'static [u8]>; 2] =
    [MESSAGES, CONVERSATIONS];
