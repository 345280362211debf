//! BackupCoordinator: rotating snapshots of the agent's state files.
//!
//! Layout under `<config_dir>/backups`:
//!
//! ```text
//! mender_backup_20260301_140502/
//!     config.yaml
//!     mender.redb
//!     modes.json
//!     manifest.json      name, size and sha256 of every copied file
//! mender_backup_20260301_140502_1/   second backup within the same second
//! ```
//!
//! Names carry UTC time, so they sort chronologically across DST and
//! timezone changes.
//!
//! Restore is not transactional. Digests are verified up front, but an I/O
//! failure midway leaves some live files replaced and others not.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use mender_core::{AppPaths, APP_NAME};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::action::{ActionKind, ActionLog, HealingAction};
use crate::error::{HealError, HealResult};

pub const MANIFEST_FILE: &str = "manifest.json";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

impl BackupManifest {
    pub fn read(dir: &Path) -> HealResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read(&path).map_err(|e| HealError::io(&path, e))?;
        serde_json::from_slice(&content).map_err(|e| HealError::Manifest(e.to_string()))
    }

    fn write(&self, dir: &Path) -> HealResult<()> {
        let path = dir.join(MANIFEST_FILE);
        let content =
            serde_json::to_vec_pretty(self).map_err(|e| HealError::Manifest(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| HealError::io(&path, e))
    }

    /// First entry whose copy in `dir` is missing or differs from its digest.
    pub fn verify(&self, dir: &Path) -> Result<(), String> {
        for entry in &self.files {
            let path = dir.join(&entry.name);
            let digest = sha256_file(&path).map_err(|e| format!("{}: {e}", entry.name))?;
            if digest != entry.sha256 {
                return Err(format!("{}: digest mismatch", entry.name));
            }
        }
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Parse `mender_backup_YYYYMMDD_HHMMSS[_N]` into its sort key.
pub fn parse_backup_name(name: &str) -> Option<(NaiveDateTime, u32)> {
    let rest = name.strip_prefix(APP_NAME)?.strip_prefix("_backup_")?;
    let (stamp, suffix) = match rest.get(15..) {
        Some("") => (rest, None),
        Some(tail) => (rest.get(..15)?, Some(tail.strip_prefix('_')?)),
        None => return None,
    };
    let at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    let n = match suffix {
        None => 0,
        Some(n) => n.parse().ok()?,
    };
    Some((at, n))
}

pub struct BackupCoordinator {
    paths: AppPaths,
    log: Arc<ActionLog>,
    keep: usize,
}

impl BackupCoordinator {
    pub fn new(paths: AppPaths, log: Arc<ActionLog>, keep: usize) -> Self {
        Self { paths, log, keep }
    }

    /// Snapshot every state file that exists, then rotate.
    pub fn backup(&self) -> HealResult<PathBuf> {
        let root = self.paths.backups_dir();
        std::fs::create_dir_all(&root).map_err(|e| HealError::io(&root, e))?;
        let dir = self.create_backup_dir(&root)?;

        match self.fill(&dir) {
            Ok(copied) => {
                self.log.record(
                    HealingAction::new(
                        ActionKind::Backup,
                        format!("Backed up {} files to {}", copied.len(), dir.display()),
                        true,
                    )
                    .with_details(json!({
                        "path": dir.display().to_string(),
                        "files": copied,
                    })),
                );
                self.rotate();
                Ok(dir)
            }
            Err(e) => {
                self.log.record(
                    HealingAction::new(ActionKind::Backup, "Backup failed", false).with_error(&e),
                );
                if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                    warn!(?dir, error = %cleanup, "could not remove partial backup");
                }
                Err(e)
            }
        }
    }

    fn create_backup_dir(&self, root: &Path) -> HealResult<PathBuf> {
        let base = format!(
            "{APP_NAME}_backup_{}",
            Utc::now().format(TIMESTAMP_FORMAT)
        );
        let mut candidate = root.join(&base);
        let mut n = 0u32;
        loop {
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    n += 1;
                    candidate = root.join(format!("{base}_{n}"));
                }
                Err(e) => return Err(HealError::io(&candidate, e)),
            }
        }
    }

    /// Copy state files into `dir` and write the manifest. Returns copied names.
    fn fill(&self, dir: &Path) -> HealResult<Vec<String>> {
        let mut files = Vec::new();
        for state in self.paths.state_files() {
            let source = state.path();
            if !source.is_file() {
                continue;
            }
            let target = dir.join(state.name);
            let size = std::fs::copy(&source, &target).map_err(|e| HealError::io(&source, e))?;
            let sha256 = sha256_file(&target).map_err(|e| HealError::io(&target, e))?;
            files.push(ManifestEntry {
                name: state.name.to_string(),
                size,
                sha256,
            });
        }
        let manifest = BackupManifest {
            created_at: Utc::now(),
            files,
        };
        manifest.write(dir)?;
        Ok(manifest.files.into_iter().map(|f| f.name).collect())
    }

    /// Backup directories, newest first. Unrecognized entries are ignored.
    pub fn list_backups(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.paths.backups_dir()) else {
            return Vec::new();
        };
        let mut backups: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| {
                let key = parse_backup_name(e.file_name().to_str()?)?;
                Some((key, e.path()))
            })
            .collect();
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        backups.into_iter().map(|(_, path)| path).collect()
    }

    /// Delete all but the newest `keep` backups. Returns how many went.
    pub fn rotate(&self) -> usize {
        let mut removed = 0;
        for old in self.list_backups().into_iter().skip(self.keep) {
            match std::fs::remove_dir_all(&old) {
                Ok(()) => {
                    debug!(path = ?old, "rotated out old backup");
                    removed += 1;
                }
                Err(e) => warn!(path = ?old, error = %e, "could not remove old backup"),
            }
        }
        removed
    }

    /// Copy every recognized file in `dir` over its live counterpart.
    ///
    /// Returns `false` when `dir` is missing, its manifest does not match its
    /// contents, or any copy fails.
    pub fn restore(&self, dir: &Path) -> bool {
        if !dir.is_dir() {
            self.restore_failed(dir, "backup not found");
            return false;
        }

        if dir.join(MANIFEST_FILE).exists() {
            let verified = BackupManifest::read(dir)
                .map_err(|e| e.to_string())
                .and_then(|m| m.verify(dir));
            if let Err(reason) = verified {
                self.restore_failed(dir, &reason);
                return false;
            }
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.restore_failed(dir, &e.to_string());
                return false;
            }
        };

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == MANIFEST_FILE {
                continue;
            }
            let Some(target) = self.paths.route(&name) else {
                debug!(%name, "skipping unrecognized file in backup");
                continue;
            };
            let copied = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::copy(entry.path(), &target));
            match copied {
                Ok(_) => restored.push(name),
                Err(e) => {
                    warn!(%name, error = %e, "restore copy failed");
                    failed.push(format!("{name}: {e}"));
                }
            }
        }

        let success = failed.is_empty();
        let mut action = HealingAction::new(
            ActionKind::Restore,
            format!("Restored {} files from {}", restored.len(), dir.display()),
            success,
        )
        .with_details(json!({ "files": restored, "failed": failed }));
        if !success {
            action = action.with_error(failed.join("; "));
        }
        self.log.record(action);
        success
    }

    fn restore_failed(&self, dir: &Path, reason: &str) {
        self.log.record(
            HealingAction::new(
                ActionKind::Restore,
                format!("Restore from {} refused", dir.display()),
                false,
            )
            .with_error(reason),
        );
    }
}
