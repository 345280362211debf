//! IntegrityGuardian: startup and on-demand repair of the directory layout,
//! the config document, and the database file.
//!
//! Nothing here returns an error. Each step records what it did in the
//! [`ActionLog`] and degrades: a failed backup does not block the repair,
//! and a failed repair leaves the subsystem on defaults or an empty store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use mender_core::{inspect_document, AppPaths, ConfigManager, DocumentState};
use mender_store::{IntegrityReport, StoreError, StoreMaintenance, StoreResult};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::action::{ActionKind, ActionLog, HealingAction};

/// Result of ensuring one directory exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryCheck {
    pub path: PathBuf,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DirectoryCheck {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfigOutcome {
    /// No document yet (first run).
    Missing,
    Ok,
    /// Corrupt document replaced with defaults.
    Repaired {
        reason: String,
        backup: Option<PathBuf>,
    },
    /// Corrupt, and writing defaults failed too.
    RepairFailed {
        reason: String,
        backup: Option<PathBuf>,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DatabaseOutcome {
    Missing,
    Ok,
    /// Another handle holds the database lock; it was not checked or touched.
    InUse {
        detail: String,
    },
    /// Reindex and compaction brought the file back to a clean check.
    Repaired {
        reason: String,
        backup: Option<PathBuf>,
    },
    /// The file was deleted and will be recreated empty on next open.
    /// Its contents survive only in `backup`.
    Recreated {
        reason: String,
        backup: Option<PathBuf>,
    },
    /// Repair failed and the file could not be removed either.
    Unrecoverable {
        reason: String,
        backup: Option<PathBuf>,
        error: String,
    },
}

impl DatabaseOutcome {
    /// Whether the live database content was lost.
    pub fn data_lost(&self) -> bool {
        matches!(self, DatabaseOutcome::Recreated { .. })
    }
}

/// Everything `initialize` found and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardianReport {
    pub directories: Vec<DirectoryCheck>,
    pub config: ConfigOutcome,
    pub database: DatabaseOutcome,
}

pub struct IntegrityGuardian {
    paths: AppPaths,
    config: Arc<dyn ConfigManager>,
    store: Arc<dyn StoreMaintenance>,
    log: Arc<ActionLog>,
}

impl IntegrityGuardian {
    pub fn new(
        paths: AppPaths,
        config: Arc<dyn ConfigManager>,
        store: Arc<dyn StoreMaintenance>,
        log: Arc<ActionLog>,
    ) -> Self {
        Self {
            paths,
            config,
            store,
            log,
        }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Directories, then config, then database.
    pub fn initialize(&self) -> GuardianReport {
        let directories = self.ensure_directories();
        let config = self.verify_config();
        let database = self.verify_database();
        GuardianReport {
            directories,
            config,
            database,
        }
    }

    pub fn ensure_directories(&self) -> Vec<DirectoryCheck> {
        self.paths
            .directories()
            .into_iter()
            .map(|dir| self.ensure_directory(dir))
            .collect()
    }

    fn ensure_directory(&self, dir: &Path) -> DirectoryCheck {
        if dir.is_dir() {
            return DirectoryCheck {
                path: dir.to_path_buf(),
                created: false,
                error: None,
            };
        }
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                self.log.record(HealingAction::new(
                    ActionKind::DirCreate,
                    format!("Created missing directory {}", dir.display()),
                    true,
                ));
                DirectoryCheck {
                    path: dir.to_path_buf(),
                    created: true,
                    error: None,
                }
            }
            Err(e) => {
                self.log.record(
                    HealingAction::new(
                        ActionKind::DirCreate,
                        format!("Failed to create directory {}", dir.display()),
                        false,
                    )
                    .with_error(&e),
                );
                DirectoryCheck {
                    path: dir.to_path_buf(),
                    created: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Check the config document, replacing it with defaults if corrupt.
    /// A valid document is left untouched and nothing is logged.
    pub fn verify_config(&self) -> ConfigOutcome {
        let path = self.paths.config_file();
        match inspect_document(&path) {
            DocumentState::Missing => {
                debug!(?path, "no config document yet");
                ConfigOutcome::Missing
            }
            DocumentState::Valid(_) => ConfigOutcome::Ok,
            DocumentState::Corrupt(reason) => self.repair_config(&path, reason),
        }
    }

    fn repair_config(&self, path: &Path, reason: String) -> ConfigOutcome {
        self.log.record(
            HealingAction::new(ActionKind::ConfigVerify, "Config document is corrupt", false)
                .with_error(&reason),
        );

        let backup = self.preserve(path, ActionKind::ConfigBackup, "config document");

        self.config.reset_to_defaults();
        match self.config.save() {
            Ok(()) => {
                self.log.record(HealingAction::new(
                    ActionKind::ConfigRepair,
                    "Config document reset to defaults",
                    true,
                ));
                ConfigOutcome::Repaired { reason, backup }
            }
            Err(e) => {
                self.log.record(
                    HealingAction::new(
                        ActionKind::ConfigRepair,
                        "Failed to write default config document",
                        false,
                    )
                    .with_error(&e),
                );
                ConfigOutcome::RepairFailed {
                    reason,
                    backup,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Integrity-check the database without repairing it.
    /// `None` when the file does not exist.
    pub fn check_database(&self) -> StoreResult<Option<IntegrityReport>> {
        let path = self.paths.database_file();
        if !path.exists() {
            return Ok(None);
        }
        self.store.integrity_check(&path).map(Some)
    }

    /// Check the database and run the repair ladder on any failure:
    /// reindex + compact, and failing that, delete for lazy recreation.
    pub fn verify_database(&self) -> DatabaseOutcome {
        let path = self.paths.database_file();
        let reason = match self.check_database() {
            Ok(None) => return DatabaseOutcome::Missing,
            Ok(Some(IntegrityReport::Ok)) => {
                debug!(?path, "database integrity ok");
                return DatabaseOutcome::Ok;
            }
            Ok(Some(IntegrityReport::Damaged(reason))) => reason,
            Err(e) if e.is_busy() => return in_use(&path, e),
            Err(e) => e.to_string(),
        };

        self.log.record(
            HealingAction::new(
                ActionKind::DbVerify,
                "Database failed its integrity check",
                false,
            )
            .with_error(&reason),
        );

        let backup = self.preserve(&path, ActionKind::DbBackup, "database");

        let repair_error = match self.rebuild(&path) {
            Ok(IntegrityReport::Ok) => {
                self.log.record(HealingAction::new(
                    ActionKind::DbRepair,
                    "Database repaired by reindex and compaction",
                    true,
                ));
                return DatabaseOutcome::Repaired { reason, backup };
            }
            Ok(IntegrityReport::Damaged(still)) => still,
            // Opened by someone else mid-repair; deleting it now would lose live data.
            Err(e) if e.is_busy() => return in_use(&path, e),
            Err(e) => e.to_string(),
        };
        self.log.record(
            HealingAction::new(ActionKind::DbRepair, "Database repair failed", false)
                .with_error(&repair_error),
        );

        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.log.record(
                    HealingAction::new(
                        ActionKind::DbRecreate,
                        "Database deleted; it will be recreated empty on next use",
                        true,
                    )
                    .with_details(json!({
                        "data_lost": true,
                        "backup": backup.as_ref().map(|p| p.display().to_string()),
                    })),
                );
                DatabaseOutcome::Recreated { reason, backup }
            }
            Err(e) => {
                self.log.record(
                    HealingAction::new(
                        ActionKind::DbRecreate,
                        "Could not remove damaged database",
                        false,
                    )
                    .with_error(&e),
                );
                DatabaseOutcome::Unrecoverable {
                    reason,
                    backup,
                    error: e.to_string(),
                }
            }
        }
    }

    fn rebuild(&self, path: &Path) -> StoreResult<IntegrityReport> {
        self.store.reindex(path)?;
        self.store.compact(path)?;
        self.store.integrity_check(path)
    }

    /// Best-effort copy to a fresh `<path>.corrupt.<unix secs>` sibling.
    fn preserve(&self, path: &Path, kind: ActionKind, what: &str) -> Option<PathBuf> {
        let target = corrupt_backup_path(path);
        match std::fs::copy(path, &target) {
            Ok(_) => {
                self.log.record(
                    HealingAction::new(kind, format!("Backed up corrupt {what}"), true)
                        .with_details(json!({ "path": target.display().to_string() })),
                );
                Some(target)
            }
            Err(e) => {
                warn!(?path, error = %e, "could not back up corrupt file, repairing anyway");
                self.log.record(
                    HealingAction::new(kind, format!("Could not back up corrupt {what}"), false)
                        .with_error(&e),
                );
                None
            }
        }
    }
}

fn in_use(path: &Path, error: StoreError) -> DatabaseOutcome {
    debug!(?path, error = %error, "database in use, skipping verification");
    DatabaseOutcome::InUse {
        detail: error.to_string(),
    }
}

/// First free sibling among `<path>.corrupt.<unix secs>`, then `..._1`,
/// `..._2` and so on.
pub fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut base = path.as_os_str().to_owned();
    base.push(format!(".corrupt.{}", Utc::now().timestamp()));
    let mut candidate = PathBuf::from(&base);
    let mut n = 0u32;
    while candidate.exists() {
        n += 1;
        let mut name = base.clone();
        name.push(format!("_{n}"));
        candidate = PathBuf::from(name);
    }
    candidate
}
