//! ResourceReclaimer: frees what the engine and the agent leave behind.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mender_core::AppPaths;
use mender_store::StoreMaintenance;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::action::{ActionKind, ActionLog, HealingAction};
use crate::counter::ErrorCounter;

/// What the in-memory sweep released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Error counters sitting at zero that were dropped.
    pub counters_pruned: usize,
    /// Actions still held by the log after shrinking it.
    pub actions_retained: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub gc_stats: GcStats,
    pub old_logs_cleaned: usize,
    pub db_compacted_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_compact_error: Option<String>,
}

pub struct ResourceReclaimer {
    paths: AppPaths,
    store: Arc<dyn StoreMaintenance>,
    counter: Arc<ErrorCounter>,
    log: Arc<ActionLog>,
    log_retention: Duration,
}

impl ResourceReclaimer {
    pub fn new(
        paths: AppPaths,
        store: Arc<dyn StoreMaintenance>,
        counter: Arc<ErrorCounter>,
        log: Arc<ActionLog>,
        log_retention: Duration,
    ) -> Self {
        Self {
            paths,
            store,
            counter,
            log,
            log_retention,
        }
    }

    /// Sweep, purge stale logs, compact the database. Never fails; a
    /// compaction error is carried in the report.
    pub fn cleanup(&self) -> CleanupReport {
        let gc_stats = self.sweep();
        let old_logs_cleaned = purge_logs(&self.paths.logs_dir, self.log_retention);
        let (db_compacted_bytes, db_compact_error) = match self.compact_database() {
            Ok(freed) => (freed, None),
            Err(e) => (0, Some(e)),
        };

        let report = CleanupReport {
            gc_stats,
            old_logs_cleaned,
            db_compacted_bytes,
            db_compact_error,
        };

        let mut action = HealingAction::new(
            ActionKind::Cleanup,
            format!(
                "Cleanup: pruned {} counters, removed {} old logs, compacted {} bytes",
                gc_stats.counters_pruned, old_logs_cleaned, db_compacted_bytes
            ),
            report.db_compact_error.is_none(),
        );
        if let Ok(details) = serde_json::to_value(&report) {
            action = action.with_details(details);
        }
        if let Some(e) = &report.db_compact_error {
            action = action.with_error(e);
        }
        self.log.record(action);
        report
    }

    fn sweep(&self) -> GcStats {
        GcStats {
            counters_pruned: self.counter.prune_zeros(),
            actions_retained: self.log.shrink(),
        }
    }

    /// Bytes freed by compaction. A missing database frees nothing.
    fn compact_database(&self) -> Result<u64, String> {
        let path = self.paths.database_file();
        if !path.exists() {
            return Ok(0);
        }
        let before = file_size(&path)?;
        match self.store.compact(&path) {
            Ok(()) => {}
            Err(e) if e.is_busy() => {
                debug!(?path, "database in use; compaction skipped");
                return Ok(0);
            }
            Err(e) => return Err(e.to_string()),
        }
        let after = file_size(&path)?;
        debug!(?path, before, after, "database compacted");
        Ok(before.saturating_sub(after))
    }
}

fn file_size(path: &Path) -> Result<u64, String> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| e.to_string())
}

/// Delete every file under `dir` last modified more than `retention` ago,
/// whatever its name. Individual failures are skipped.
fn purge_logs(dir: &Path, retention: Duration) -> usize {
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return 0;
    };
    let mut removed = 0;
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let stale = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .is_some_and(|modified| modified < cutoff);
        if !stale {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = ?entry.path(), error = %e, "could not remove old log"),
        }
    }
    removed
}
