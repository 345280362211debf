//! MemoryStore: redb-backed persistence for per-conversation memory.
//!
//! Provides typed CRUD operations over messages and conversation
//! summaries. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{map_err, StoreResult};
use crate::tables::*;
use crate::types::*;

/// Thread-safe conversation store backed by redb.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Database>,
}

impl MemoryStore {
    /// Open (or create) a persistent store at the given path.
    ///
    /// A database removed by a failed repair is recreated empty here.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "memory store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory memory store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Messages ───────────────────────────────────────────────────

    /// Append a message and bump the conversation summary.
    pub fn append_message(&self, message: &StoredMessage) -> StoreResult<()> {
        let key = message.table_key();
        let value = serde_json::to_vec(message).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            messages
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut conversations = txn.open_table(CONVERSATIONS).map_err(map_err!(Table))?;
            let mut summary = match conversations
                .get(message.conversation_id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => serde_json::from_slice::<Conversation>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => Conversation {
                    id: message.conversation_id.clone(),
                    title: String::new(),
                    message_count: 0,
                    updated_at: 0,
                },
            };
            summary.message_count += 1;
            summary.updated_at = message.created_at;
            let summary_value = serde_json::to_vec(&summary).map_err(map_err!(Serialize))?;
            conversations
                .insert(message.conversation_id.as_str(), summary_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "message stored");
        Ok(())
    }

    /// List a conversation's messages in sequence order.
    pub fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<StoredMessage>> {
        let prefix = format!("{conversation_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let message: StoredMessage =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(message);
            }
        }
        Ok(results)
    }

    // ── Conversations ──────────────────────────────────────────────

    /// Insert or update a conversation summary.
    pub fn put_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let value = serde_json::to_vec(conversation).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONVERSATIONS).map_err(map_err!(Table))?;
            table
                .insert(conversation.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a conversation summary by id.
    pub fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONVERSATIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let conversation: Conversation =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    /// List all conversation summaries.
    pub fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONVERSATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let conversation: Conversation =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(conversation);
        }
        Ok(results)
    }

    /// Delete a conversation and all its messages. Returns messages deleted.
    pub fn delete_conversation(&self, id: &str) -> StoreResult<u64> {
        let prefix = format!("{id}:");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            for key in &keys {
                messages.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            let mut conversations = txn.open_table(CONVERSATIONS).map_err(map_err!(Table))?;
            conversations.remove(id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, deleted = keys.len(), "conversation deleted");
        Ok(keys.len() as u64)
    }
}
