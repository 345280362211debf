//! Integrity check and maintenance passes over the database file.
//!
//! Every operation opens the file exclusively. While a
//! [`MemoryStore`](crate::MemoryStore) holds the same path, each one fails
//! with [`StoreError::Busy`] instead of touching the file.

use std::path::{Path, PathBuf};

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableError};
use tracing::{debug, info};

use crate::error::{map_err, StoreError, StoreResult};
use crate::tables::ALL_TABLES;
use crate::types::IntegrityReport;

/// Operations the resilience engine issues against the embedded store.
pub trait StoreMaintenance: Send + Sync {
    /// Run the integrity check.
    fn integrity_check(&self, path: &Path) -> StoreResult<IntegrityReport>;

    /// Rebuild every table's B-tree from its live entries.
    fn reindex(&self, path: &Path) -> StoreResult<()>;

    /// Reclaim free pages, shrinking the file.
    fn compact(&self, path: &Path) -> StoreResult<()>;
}

/// [`StoreMaintenance`] for redb database files.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedbMaintenance;

impl StoreMaintenance for RedbMaintenance {
    fn integrity_check(&self, path: &Path) -> StoreResult<IntegrityReport> {
        let mut db = open_exclusive(path)?;
        // redb repairs what it can during the check and reports false when it had to.
        match db.check_integrity() {
            Ok(true) => Ok(IntegrityReport::Ok),
            Ok(false) => Ok(IntegrityReport::Damaged(
                "allocator state was inconsistent and had to be repaired".to_string(),
            )),
            Err(e) => Err(StoreError::Integrity(e.to_string())),
        }
    }

    fn reindex(&self, path: &Path) -> StoreResult<()> {
        let rebuilt = rebuild_path(path);
        if rebuilt.exists() {
            std::fs::remove_file(&rebuilt).map_err(map_err!(Io))?;
        }
        if let Err(e) = copy_tables(path, &rebuilt) {
            let _ = std::fs::remove_file(&rebuilt);
            return Err(e);
        }
        std::fs::rename(&rebuilt, path).map_err(map_err!(Io))?;
        info!(?path, "database rebuilt");
        Ok(())
    }

    fn compact(&self, path: &Path) -> StoreResult<()> {
        let mut db = open_exclusive(path)?;
        let compacted = db.compact().map_err(map_err!(Compaction))?;
        debug!(?path, compacted, "database compaction finished");
        Ok(())
    }
}

/// Open `path`, telling lock contention apart from a file redb cannot read.
fn open_exclusive(path: &Path) -> StoreResult<Database> {
    Database::open(path).map_err(|e| match e {
        DatabaseError::DatabaseAlreadyOpen => StoreError::Busy(path.display().to_string()),
        other => StoreError::Open(other.to_string()),
    })
}

fn rebuild_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".rebuild");
    PathBuf::from(name)
}

/// Copy every known table from `source` into a fresh database at `target`.
fn copy_tables(source: &Path, target: &Path) -> StoreResult<()> {
    let source = open_exclusive(source)?;
    let target = Database::create(target).map_err(map_err!(Open))?;

    let read = source.begin_read().map_err(map_err!(Transaction))?;
    let write = target.begin_write().map_err(map_err!(Transaction))?;
    let mut copied = 0u64;
    for definition in ALL_TABLES {
        let table = match read.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => continue,
            Err(e) => return Err(StoreError::Table(e.to_string())),
        };
        let mut out = write.open_table(definition).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            out.insert(key.value(), value.value())
                .map_err(map_err!(Write))?;
            copied += 1;
        }
    }
    write.commit().map_err(map_err!(Transaction))?;
    debug!(copied, "tables copied into rebuilt database");
    Ok(())
}
