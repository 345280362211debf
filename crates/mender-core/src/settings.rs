//! mender.toml: tuning knobs for the resilience engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingSettings {
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    pub maintenance: MaintenanceSettings,
    pub disk: DiskSettings,
    pub schedule: ScheduleSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub log_retention_days: u64,
    pub keep_backups: usize,
    pub max_actions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSettings {
    pub critical_gb: f64,
    pub low_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub health_interval_secs: u64,
    pub backup_interval_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_cap_secs: 60,
        }
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_secs: 60,
        }
    }
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            log_retention_days: 7,
            keep_backups: 5,
            max_actions: 500,
        }
    }
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            critical_gb: 0.5,
            low_gb: 2.0,
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: 3600,
            backup_interval_secs: 6 * 3600,
        }
    }
}

impl RetrySettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

impl CircuitSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl MaintenanceSettings {
    pub fn log_retention(&self) -> Duration {
        Duration::from_secs(self.log_retention_days * 86_400)
    }
}

impl HealingSettings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: HealingSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Read the settings file if present, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(?path, "no settings file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = HealingSettings::default();
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.backoff_base(), Duration::from_secs(1));
        assert_eq!(settings.retry.backoff_cap(), Duration::from_secs(60));
        assert_eq!(settings.maintenance.keep_backups, 5);
        assert_eq!(settings.maintenance.max_actions, 500);
        assert_eq!(
            settings.maintenance.log_retention(),
            Duration::from_secs(7 * 86_400)
        );
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[retry]
max_retries = 2

[disk]
critical_gb = 1.0
"#;
        let settings: HealingSettings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.retry.backoff_base_ms, 1000);
        assert_eq!(settings.disk.critical_gb, 1.0);
        assert_eq!(settings.disk.low_gb, 2.0);
        assert_eq!(settings.circuit.threshold, 5);
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.toml");
        let mut settings = HealingSettings::default();
        settings.schedule.health_interval_secs = 60;
        std::fs::write(&path, settings.to_toml_string().unwrap()).unwrap();

        let loaded = HealingSettings::load_or_default(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = HealingSettings::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, HealingSettings::default());
    }
}
