//! mender-store: the agent's embedded relational store.
//!
//! Backed by [redb](https://docs.rs/redb). Conversation messages and
//! conversation summaries are JSON-serialized into `&[u8]` value columns
//! keyed by `{conversation_id}:{seq}` and `{conversation_id}`.
//!
//! Besides the typed CRUD surface used by the rest of the agent, the crate
//! exposes [`StoreMaintenance`]: the integrity check and maintenance passes
//! the resilience engine runs against the database file.

pub mod error;
pub mod maintenance;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use maintenance::{RedbMaintenance, StoreMaintenance};
pub use store::MemoryStore;
pub use types::*;
