//! On-disk layout of the agent's state.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Application name used for the home directory and backup archives.
pub const APP_NAME: &str = "mender";

const CONFIG_FILE: &str = "config.yaml";
const SETTINGS_FILE: &str = "mender.toml";
const DATABASE_FILE: &str = "mender.redb";
const BACKUPS_DIR: &str = "backups";

/// Small JSON state files kept next to the config document.
const JSON_STATE_FILES: [&str; 3] = ["modes.json", "status.json", "themes.json"];

/// The four logical directories plus the files derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub memory_dir: PathBuf,
}

/// A named state file and the directory it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    pub name: &'static str,
    pub dir: PathBuf,
}

impl StateFile {
    pub fn path(&self) -> PathBuf {
        self.dir.join(self.name)
    }
}

impl AppPaths {
    /// Lay out all four directories under a single root.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.to_path_buf(),
            data_dir: root.join("data"),
            logs_dir: root.join("logs"),
            memory_dir: root.join("memory"),
        }
    }

    /// `~/.mender` and its subdirectories.
    pub fn home_default() -> CoreResult<Self> {
        let home = dirs::home_dir().ok_or(CoreError::NoHome)?;
        Ok(Self::from_root(home.join(format!(".{APP_NAME}"))))
    }

    /// The four directories in check order.
    pub fn directories(&self) -> [&Path; 4] {
        [
            &self.config_dir,
            &self.data_dir,
            &self.logs_dir,
            &self.memory_dir,
        ]
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    pub fn database_file(&self) -> PathBuf {
        self.memory_dir.join(DATABASE_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.config_dir.join(BACKUPS_DIR)
    }

    /// Every file included in a backup, with its live location.
    pub fn state_files(&self) -> Vec<StateFile> {
        let mut files = vec![
            StateFile {
                name: CONFIG_FILE,
                dir: self.config_dir.clone(),
            },
            StateFile {
                name: DATABASE_FILE,
                dir: self.memory_dir.clone(),
            },
        ];
        files.extend(JSON_STATE_FILES.iter().map(|name| StateFile {
            name,
            dir: self.config_dir.clone(),
        }));
        files
    }

    /// Route a file name found in a backup to its live destination.
    ///
    /// Returns `None` for anything that is not a known state file.
    pub fn route(&self, file_name: &str) -> Option<PathBuf> {
        match file_name {
            CONFIG_FILE => Some(self.config_dir.join(file_name)),
            DATABASE_FILE => Some(self.memory_dir.join(file_name)),
            name if JSON_STATE_FILES.contains(&name) => Some(self.config_dir.join(name)),
            _ => None,
        }
    }
}
