//! The `Resilience` handle: one engine value built at startup and cloned
//! into every subsystem that needs retries, breakers, or repair.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mender_core::{AppPaths, ConfigManager, HealingSettings, YamlConfigManager};
use mender_store::{RedbMaintenance, StoreMaintenance};
use serde::Serialize;

use crate::action::{ActionLog, HealingAction};
use crate::backup::BackupCoordinator;
use crate::circuit::{BreakerPolicy, CircuitBreakerRegistry, CircuitSnapshot};
use crate::counter::ErrorCounter;
use crate::error::HealResult;
use crate::executor::{RetryPolicy, SafeExecutor};
use crate::health::{DiskProbe, HealthCheckRunner, HealthReport, StatvfsProbe};
use crate::integrity::{GuardianReport, IntegrityGuardian};
use crate::patterns::{ComponentErrors, ErrorPatternAnalyzer, FixSuggestion};
use crate::reclaim::{CleanupReport, ResourceReclaimer};

/// Default page size for [`Resilience::recent_actions`].
pub const DEFAULT_RECENT_ACTIONS: usize = 50;

/// Aggregate counters for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    /// Actions currently retained by the log.
    pub total_actions: usize,
    /// Actions ever recorded, including evicted ones.
    pub recorded_actions: u64,
    pub successful: usize,
    pub failed: usize,
    pub error_counts: BTreeMap<String, u32>,
    pub circuit_breakers: BTreeMap<String, CircuitSnapshot>,
}

pub struct ResilienceBuilder {
    paths: AppPaths,
    settings: HealingSettings,
    config: Option<Arc<dyn ConfigManager>>,
    store: Option<Arc<dyn StoreMaintenance>>,
    disk: Option<Arc<dyn DiskProbe>>,
}

impl ResilienceBuilder {
    pub fn settings(mut self, settings: HealingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Defaults to a [`YamlConfigManager`] on the layout's config document.
    pub fn config_manager(mut self, config: Arc<dyn ConfigManager>) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to [`RedbMaintenance`].
    pub fn store_maintenance(mut self, store: Arc<dyn StoreMaintenance>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`StatvfsProbe`].
    pub fn disk_probe(mut self, disk: Arc<dyn DiskProbe>) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn build(self) -> Resilience {
        let Self {
            paths,
            settings,
            config,
            store,
            disk,
        } = self;
        let config: Arc<dyn ConfigManager> = match config {
            Some(config) => config,
            None => Arc::new(YamlConfigManager::new(paths.config_file())),
        };
        let store: Arc<dyn StoreMaintenance> = match store {
            Some(store) => store,
            None => Arc::new(RedbMaintenance),
        };
        let disk: Arc<dyn DiskProbe> = match disk {
            Some(disk) => disk,
            None => Arc::new(StatvfsProbe),
        };

        let log = Arc::new(ActionLog::new(settings.maintenance.max_actions));
        let counter = Arc::new(ErrorCounter::new());
        let circuits = Arc::new(CircuitBreakerRegistry::new(log.clone()));
        let analyzer = Arc::new(ErrorPatternAnalyzer::new(counter.clone()));

        let executor = SafeExecutor::new(
            RetryPolicy::from_settings(&settings.retry),
            counter.clone(),
            log.clone(),
        );
        let guardian = Arc::new(IntegrityGuardian::new(
            paths.clone(),
            config,
            store.clone(),
            log.clone(),
        ));
        let reclaimer = Arc::new(ResourceReclaimer::new(
            paths.clone(),
            store,
            counter.clone(),
            log.clone(),
            settings.maintenance.log_retention(),
        ));
        let backups = BackupCoordinator::new(
            paths.clone(),
            log.clone(),
            settings.maintenance.keep_backups,
        );
        let health = HealthCheckRunner::new(
            guardian.clone(),
            reclaimer.clone(),
            circuits.clone(),
            analyzer.clone(),
            disk,
            settings.disk.clone(),
        );

        Resilience {
            inner: Arc::new(Inner {
                paths,
                settings,
                log,
                counter,
                circuits,
                executor,
                guardian,
                reclaimer,
                backups,
                analyzer,
                health,
            }),
        }
    }
}

struct Inner {
    paths: AppPaths,
    settings: HealingSettings,
    log: Arc<ActionLog>,
    counter: Arc<ErrorCounter>,
    circuits: Arc<CircuitBreakerRegistry>,
    executor: SafeExecutor,
    guardian: Arc<IntegrityGuardian>,
    reclaimer: Arc<ResourceReclaimer>,
    backups: BackupCoordinator,
    analyzer: Arc<ErrorPatternAnalyzer>,
    health: HealthCheckRunner,
}

/// Cheap to clone; every clone shares the same log, counters and breakers.
#[derive(Clone)]
pub struct Resilience {
    inner: Arc<Inner>,
}

impl Resilience {
    pub fn builder(paths: AppPaths) -> ResilienceBuilder {
        ResilienceBuilder {
            paths,
            settings: HealingSettings::default(),
            config: None,
            store: None,
            disk: None,
        }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.inner.paths
    }

    pub fn settings(&self) -> &HealingSettings {
        &self.inner.settings
    }

    /// Startup pass: directories, config document, database.
    pub fn initialize(&self) -> GuardianReport {
        self.inner.guardian.initialize()
    }

    /// Re-run the startup pass and return the actions it took.
    pub fn auto_repair(&self) -> Vec<HealingAction> {
        let mark = self.inner.log.recorded();
        self.inner.guardian.initialize();
        self.inner.log.since(mark)
    }

    pub fn executor(&self) -> &SafeExecutor {
        &self.inner.executor
    }

    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.inner.circuits
    }

    /// Breaker threshold and cooldown from settings.
    pub fn breaker_policy(&self) -> BreakerPolicy {
        let circuit = &self.inner.settings.circuit;
        BreakerPolicy::new(circuit.threshold, circuit.cooldown())
    }

    pub fn backup(&self) -> HealResult<PathBuf> {
        self.inner.backups.backup()
    }

    pub fn restore(&self, dir: &Path) -> bool {
        self.inner.backups.restore(dir)
    }

    pub fn list_backups(&self) -> Vec<PathBuf> {
        self.inner.backups.list_backups()
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.inner.reclaimer.cleanup()
    }

    pub fn health_check(&self) -> HealthReport {
        self.inner.health.run()
    }

    pub fn run_check(&self, name: &str) -> HealResult<HealthReport> {
        self.inner.health.run_check(name)
    }

    pub fn error_patterns(&self) -> BTreeMap<String, ComponentErrors> {
        self.inner.analyzer.patterns()
    }

    pub fn suggest_fixes(&self) -> Vec<FixSuggestion> {
        self.inner.analyzer.suggest_fixes()
    }

    /// The newest `limit` actions, oldest first.
    pub fn recent_actions(&self, limit: usize) -> Vec<HealingAction> {
        self.inner.log.recent(limit)
    }

    pub fn stats(&self) -> EngineStats {
        let (successful, failed) = self.inner.log.outcome_counts();
        EngineStats {
            total_actions: successful + failed,
            recorded_actions: self.inner.log.recorded(),
            successful,
            failed,
            error_counts: self.inner.counter.snapshot(),
            circuit_breakers: self.inner.circuits.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;

    fn engine(root: &Path) -> Resilience {
        Resilience::builder(AppPaths::from_root(root)).build()
    }

    #[test]
    fn clones_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let a = engine(dir.path());
        let b = a.clone();
        a.circuits()
            .record_failure("x", BreakerPolicy::new(1, std::time::Duration::from_secs(60)));
        assert_eq!(b.circuits().open_circuits(), vec!["x".to_string()]);
        assert_eq!(b.stats().total_actions, 1);
    }

    #[test]
    fn settings_flow_into_components() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = HealingSettings::default();
        settings.retry.max_retries = 1;
        settings.retry.backoff_base_ms = 1;
        settings.circuit.threshold = 2;
        let engine = Resilience::builder(AppPaths::from_root(dir.path()))
            .settings(settings)
            .build();

        assert_eq!(engine.executor().policy().max_retries, 1);
        assert_eq!(engine.breaker_policy().threshold, 2);
        let calls = std::cell::Cell::new(0);
        engine.executor().execute("c", "o", (), || {
            calls.set(calls.get() + 1);
            Err::<(), _>("x")
        });
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn auto_repair_returns_only_new_actions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir.path().join("agent"));
        let first = engine.auto_repair();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|a| a.kind == ActionKind::DirCreate));
        assert!(engine.auto_repair().is_empty());
    }

    #[test]
    fn stats_summarize_log_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = HealingSettings::default();
        settings.retry.max_retries = 0;
        let engine = Resilience::builder(AppPaths::from_root(dir.path()))
            .settings(settings)
            .build();
        engine.executor().execute("memory", "load", 0, || Err::<i32, _>("gone"));
        engine.initialize();

        let stats = engine.stats();
        assert_eq!(stats.error_counts["memory.load"], 1);
        assert_eq!(stats.failed, 0);
        // fallback + 3 created subdirectories (the root already exists)
        assert_eq!(stats.successful, 4);
        assert_eq!(engine.recent_actions(DEFAULT_RECENT_ACTIONS).len(), 4);
    }
}
