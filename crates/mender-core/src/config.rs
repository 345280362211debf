//! config.yaml: the agent's human-editable config document.
//!
//! The resilience engine treats the document as opaque: it only needs to
//! tell a healthy document from a corrupt one and to ask the manager to
//! put the defaults back.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// What a config document on disk looks like right now.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentState {
    /// No file yet; normal on first run.
    Missing,
    /// Parsed to a string-keyed mapping.
    Valid(Mapping),
    /// Unreadable, unparsable, empty, or not a mapping.
    Corrupt(String),
}

impl DocumentState {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, DocumentState::Corrupt(_))
    }
}

/// Classify the document at `path` without modifying it.
pub fn inspect_document(path: &Path) -> DocumentState {
    if !path.exists() {
        return DocumentState::Missing;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => return DocumentState::Corrupt(format!("unreadable: {e}")),
    };
    if content.trim().is_empty() {
        return DocumentState::Corrupt("document is empty".to_string());
    }
    match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Mapping(map)) => match first_non_string_key(&map) {
            Some(key) => DocumentState::Corrupt(format!("non-string key: {key:?}")),
            None => DocumentState::Valid(map),
        },
        Ok(Value::Null) => DocumentState::Corrupt("document is empty".to_string()),
        Ok(_) => DocumentState::Corrupt("top-level value is not a mapping".to_string()),
        Err(e) => DocumentState::Corrupt(e.to_string()),
    }
}

fn first_non_string_key(map: &Mapping) -> Option<Value> {
    for (key, value) in map {
        if !key.is_string() {
            return Some(key.clone());
        }
        if let Value::Mapping(inner) = value {
            if let Some(bad) = first_non_string_key(inner) {
                return Some(bad);
            }
        }
    }
    None
}

/// The external collaborator that owns the config document.
pub trait ConfigManager: Send + Sync {
    /// Read the document, merged over the defaults.
    fn load(&self) -> CoreResult<Mapping>;

    /// Replace the in-memory document with the defaults.
    fn reset_to_defaults(&self);

    /// Persist the in-memory document.
    fn save(&self) -> CoreResult<()>;
}

// ── Defaults ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub system: SystemSection,
    pub memory: MemorySection,
    pub dashboard: DashboardSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSection {
    pub name: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    pub enabled: bool,
    pub max_context_messages: u32,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub open_browser: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system: SystemSection {
                name: "mender".to_string(),
                log_level: "info".to_string(),
                host: "127.0.0.1".to_string(),
                port: 7860,
            },
            memory: MemorySection {
                enabled: true,
                max_context_messages: 50,
                retention_days: 90,
            },
            dashboard: DashboardSection {
                enabled: true,
                host: "127.0.0.1".to_string(),
                port: 7860,
                open_browser: true,
            },
        }
    }
}

/// Default document as a YAML mapping.
pub fn default_document() -> Mapping {
    match serde_yaml::to_value(AgentConfig::default()) {
        Ok(Value::Mapping(map)) => map,
        _ => Mapping::new(),
    }
}

/// Environment variables that override a nested key.
const ENV_OVERRIDES: [(&str, &[&str]); 3] = [
    ("MENDER_PORT", &["system", "port"]),
    ("MENDER_HOST", &["system", "host"]),
    ("MENDER_LOG_LEVEL", &["system", "log_level"]),
];

/// Recursively merge `overlay` into `base`.
pub fn deep_merge(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        match value {
            Value::Mapping(incoming) => {
                if let Some(Value::Mapping(existing)) = base.get_mut(&key) {
                    deep_merge(existing, incoming);
                } else {
                    base.insert(key, Value::Mapping(incoming));
                }
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `MENDER_*` overrides from the given variables.
pub fn apply_overrides<I>(doc: &mut Mapping, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, raw) in vars {
        let Some((_, keys)) = ENV_OVERRIDES.iter().find(|(env, _)| *env == name) else {
            continue;
        };
        let value = match raw.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => Value::String(raw),
        };
        set_nested(doc, keys, value);
    }
}

fn set_nested(doc: &mut Mapping, keys: &[&str], value: Value) {
    let Some((last, parents)) = keys.split_last() else {
        return;
    };
    let mut cursor = doc;
    for key in parents {
        let entry = cursor
            .entry(Value::String((*key).to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !entry.is_mapping() {
            *entry = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(next) = entry else {
            return;
        };
        cursor = next;
    }
    cursor.insert(Value::String((*last).to_string()), value);
}

// ── YAML-backed manager ────────────────────────────────────────────

/// File-backed config manager with deep-merged defaults.
pub struct YamlConfigManager {
    path: PathBuf,
    document: Mutex<Mapping>,
}

impl YamlConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: Mutex::new(default_document()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a nested value in the in-memory document.
    pub fn get(&self, keys: &[&str]) -> Option<Value> {
        let doc = self.document.lock();
        let (first, rest) = keys.split_first()?;
        let mut value = doc.get(*first)?;
        for key in rest {
            value = value.as_mapping()?.get(*key)?;
        }
        Some(value.clone())
    }
}

impl ConfigManager for YamlConfigManager {
    fn load(&self) -> CoreResult<Mapping> {
        let mut merged = default_document();
        match inspect_document(&self.path) {
            DocumentState::Missing => {
                debug!(path = ?self.path, "config document missing, writing defaults");
                *self.document.lock() = merged.clone();
                self.save()?;
            }
            DocumentState::Valid(file) => {
                deep_merge(&mut merged, file);
            }
            DocumentState::Corrupt(reason) => {
                warn!(path = ?self.path, %reason, "config document is corrupt");
                return Err(CoreError::CorruptDocument(reason));
            }
        }
        apply_overrides(&mut merged, std::env::vars());
        *self.document.lock() = merged.clone();
        Ok(merged)
    }

    fn reset_to_defaults(&self) {
        *self.document.lock() = default_document();
    }

    fn save(&self) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        let yaml = serde_yaml::to_string(&*self.document.lock())?;
        std::fs::write(&self.path, yaml).map_err(|e| CoreError::io(&self.path, e))?;
        debug!(path = ?self.path, "config document saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_document() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            inspect_document(&dir.path().join("config.yaml")),
            DocumentState::Missing
        );
    }

    #[test]
    fn valid_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "system:\n  port: 9000\n");
        assert!(matches!(inspect_document(&path), DocumentState::Valid(_)));
    }

    #[test]
    fn empty_document_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "  \n");
        assert!(inspect_document(&path).is_corrupt());
    }

    #[test]
    fn scalar_document_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "just a string\n");
        assert!(inspect_document(&path).is_corrupt());

        let path = write(dir.path(), "- a\n- b\n");
        assert!(inspect_document(&path).is_corrupt());
    }

    #[test]
    fn colon_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), ": :");
        assert!(inspect_document(&path).is_corrupt());
    }

    #[test]
    fn non_string_keys_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "system:\n  1: one\n");
        assert!(inspect_document(&path).is_corrupt());
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "system:\n  port: 9000\n");
        let manager = YamlConfigManager::new(&path);
        manager.load().unwrap();

        assert_eq!(manager.get(&["system", "port"]), Some(Value::from(9000)));
        assert_eq!(
            manager.get(&["system", "host"]),
            Some(Value::from("127.0.0.1"))
        );
        assert_eq!(manager.get(&["memory", "enabled"]), Some(Value::from(true)));
    }

    #[test]
    fn load_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let manager = YamlConfigManager::new(&path);
        manager.load().unwrap();
        assert!(matches!(inspect_document(&path), DocumentState::Valid(_)));
    }

    #[test]
    fn load_rejects_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), ": :");
        let manager = YamlConfigManager::new(&path);
        assert!(matches!(
            manager.load(),
            Err(CoreError::CorruptDocument(_))
        ));
    }

    #[test]
    fn reset_and_save_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), ": :");
        let manager = YamlConfigManager::new(&path);
        manager.reset_to_defaults();
        manager.save().unwrap();

        let reloaded = YamlConfigManager::new(&path).load().unwrap();
        let mut expected = default_document();
        apply_overrides(&mut expected, std::env::vars());
        assert_eq!(reloaded, expected);
    }

    #[test]
    fn overrides_set_nested_keys() {
        let mut doc = default_document();
        apply_overrides(
            &mut doc,
            vec![
                ("MENDER_PORT".to_string(), "8123".to_string()),
                ("MENDER_LOG_LEVEL".to_string(), "debug".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ],
        );
        let system = doc.get("system").unwrap().as_mapping().unwrap();
        assert_eq!(system.get("port"), Some(&Value::from(8123)));
        assert_eq!(system.get("log_level"), Some(&Value::from("debug")));
    }

    #[test]
    fn deep_merge_replaces_leaves_only() {
        let mut base = default_document();
        let overlay: Mapping = serde_yaml::from_str("dashboard:\n  enabled: false\n").unwrap();
        deep_merge(&mut base, overlay);
        let dashboard = base.get("dashboard").unwrap().as_mapping().unwrap();
        assert_eq!(dashboard.get("enabled"), Some(&Value::from(false)));
        assert_eq!(dashboard.get("port"), Some(&Value::from(7860)));
    }
}
