//! HealthCheckRunner: the six environment checks and their auto-fixes.
//!
//! Checks run in a fixed order and each appends one or more entries to the
//! report. A check that repairs something bumps `fixes_applied`; only the
//! database, circuit, and critical-disk checks (plus unrecoverable directory
//! or config failures) clear `overall_healthy`.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mender_core::settings::DiskSettings;
use mender_store::IntegrityReport;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::circuit::CircuitBreakerRegistry;
use crate::error::{HealError, HealResult};
use crate::integrity::{ConfigOutcome, IntegrityGuardian};
use crate::patterns::ErrorPatternAnalyzer;
use crate::reclaim::ResourceReclaimer;

/// Components with more errors than this are flagged by the error-rate check.
pub const ERROR_RATE_THRESHOLD: u32 = 5;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Directories,
    Database,
    Config,
    CircuitBreakers,
    ErrorRates,
    DiskSpace,
}

impl CheckKind {
    /// Every check, in run order.
    pub const ALL: [CheckKind; 6] = [
        CheckKind::Directories,
        CheckKind::Database,
        CheckKind::Config,
        CheckKind::CircuitBreakers,
        CheckKind::ErrorRates,
        CheckKind::DiskSpace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Directories => "directories",
            CheckKind::Database => "database",
            CheckKind::Config => "config",
            CheckKind::CircuitBreakers => "circuit_breakers",
            CheckKind::ErrorRates => "error_rates",
            CheckKind::DiskSpace => "disk_space",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = HealError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| HealError::UnknownCheck(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Fixed,
    Missing,
    /// Locked by another handle; not inspected.
    InUse,
    Corrupt,
    Error,
    Warning,
    Low,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckEntry {
    pub check: CheckKind,
    pub status: CheckStatus,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl CheckEntry {
    fn new(check: CheckKind, status: CheckStatus) -> Self {
        Self {
            check,
            status,
            details: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<CheckEntry>,
    pub fixes_applied: u32,
    pub overall_healthy: bool,
}

impl HealthReport {
    fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            checks: Vec::new(),
            fixes_applied: 0,
            overall_healthy: true,
        }
    }

    pub fn entries(&self, kind: CheckKind) -> impl Iterator<Item = &CheckEntry> {
        self.checks.iter().filter(move |c| c.check == kind)
    }
}

/// Free space on the filesystem holding a path.
pub trait DiskProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`DiskProbe`] backed by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    #[cfg(unix)]
    #[allow(clippy::unnecessary_cast)]
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let stat = unsafe { stat.assume_init() };
        // Space available to unprivileged processes.
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }

    #[cfg(not(unix))]
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "disk probe not available on this platform",
        ))
    }
}

pub struct HealthCheckRunner {
    guardian: Arc<IntegrityGuardian>,
    reclaimer: Arc<ResourceReclaimer>,
    circuits: Arc<CircuitBreakerRegistry>,
    analyzer: Arc<ErrorPatternAnalyzer>,
    disk: Arc<dyn DiskProbe>,
    thresholds: DiskSettings,
}

impl HealthCheckRunner {
    pub fn new(
        guardian: Arc<IntegrityGuardian>,
        reclaimer: Arc<ResourceReclaimer>,
        circuits: Arc<CircuitBreakerRegistry>,
        analyzer: Arc<ErrorPatternAnalyzer>,
        disk: Arc<dyn DiskProbe>,
        thresholds: DiskSettings,
    ) -> Self {
        Self {
            guardian,
            reclaimer,
            circuits,
            analyzer,
            disk,
            thresholds,
        }
    }

    /// Run every check in order.
    pub fn run(&self) -> HealthReport {
        let mut report = HealthReport::new();
        for kind in CheckKind::ALL {
            self.check(kind, &mut report);
        }
        info!(
            healthy = report.overall_healthy,
            fixes = report.fixes_applied,
            "health check complete"
        );
        report
    }

    /// Run a single check by name.
    pub fn run_check(&self, name: &str) -> HealResult<HealthReport> {
        let kind: CheckKind = name.parse()?;
        let mut report = HealthReport::new();
        self.check(kind, &mut report);
        Ok(report)
    }

    fn check(&self, kind: CheckKind, report: &mut HealthReport) {
        debug!(check = %kind, "running health check");
        match kind {
            CheckKind::Directories => self.check_directories(report),
            CheckKind::Database => self.check_database(report),
            CheckKind::Config => self.check_config(report),
            CheckKind::CircuitBreakers => self.check_circuits(report),
            CheckKind::ErrorRates => self.check_error_rates(report),
            CheckKind::DiskSpace => self.check_disk(report),
        }
    }

    fn check_directories(&self, report: &mut HealthReport) {
        for dir in self.guardian.ensure_directories() {
            let path = dir.path.display().to_string();
            let entry = match (&dir.error, dir.created) {
                (Some(e), _) => {
                    report.overall_healthy = false;
                    CheckEntry::new(CheckKind::Directories, CheckStatus::Error)
                        .with("error", e.as_str())
                }
                (None, true) => {
                    report.fixes_applied += 1;
                    CheckEntry::new(CheckKind::Directories, CheckStatus::Fixed)
                }
                (None, false) => CheckEntry::new(CheckKind::Directories, CheckStatus::Ok),
            };
            report.checks.push(entry.with("path", path));
        }
    }

    /// Report only; repair belongs to startup initialization.
    fn check_database(&self, report: &mut HealthReport) {
        let entry = match self.guardian.check_database() {
            Ok(None) => CheckEntry::new(CheckKind::Database, CheckStatus::Missing),
            Ok(Some(IntegrityReport::Ok)) => CheckEntry::new(CheckKind::Database, CheckStatus::Ok),
            Ok(Some(IntegrityReport::Damaged(detail))) => {
                report.overall_healthy = false;
                CheckEntry::new(CheckKind::Database, CheckStatus::Error).with("error", detail)
            }
            Err(e) if e.is_busy() => CheckEntry::new(CheckKind::Database, CheckStatus::InUse)
                .with("detail", e.to_string()),
            Err(e) => {
                report.overall_healthy = false;
                CheckEntry::new(CheckKind::Database, CheckStatus::Error)
                    .with("error", e.to_string())
            }
        };
        report.checks.push(entry);
    }

    fn check_config(&self, report: &mut HealthReport) {
        let entry = match self.guardian.verify_config() {
            ConfigOutcome::Missing => CheckEntry::new(CheckKind::Config, CheckStatus::Missing),
            ConfigOutcome::Ok => CheckEntry::new(CheckKind::Config, CheckStatus::Ok),
            ConfigOutcome::Repaired { reason, .. } => {
                report.fixes_applied += 1;
                CheckEntry::new(CheckKind::Config, CheckStatus::Corrupt)
                    .with("reason", reason)
                    .with("repaired", true)
            }
            ConfigOutcome::RepairFailed { reason, error, .. } => {
                report.overall_healthy = false;
                CheckEntry::new(CheckKind::Config, CheckStatus::Corrupt)
                    .with("reason", reason)
                    .with("repaired", false)
                    .with("error", error)
            }
        };
        report.checks.push(entry);
    }

    fn check_circuits(&self, report: &mut HealthReport) {
        let open = self.circuits.open_circuits();
        let entry = if open.is_empty() {
            CheckEntry::new(CheckKind::CircuitBreakers, CheckStatus::Ok)
        } else {
            report.overall_healthy = false;
            CheckEntry::new(CheckKind::CircuitBreakers, CheckStatus::Warning)
                .with("open", json!(open))
        };
        report.checks.push(entry);
    }

    /// Advisory only.
    fn check_error_rates(&self, report: &mut HealthReport) {
        let noisy = self.analyzer.components_above(ERROR_RATE_THRESHOLD);
        let entry = if noisy.is_empty() {
            CheckEntry::new(CheckKind::ErrorRates, CheckStatus::Ok)
        } else {
            let components: Map<String, Value> =
                noisy.into_iter().map(|(c, n)| (c, Value::from(n))).collect();
            CheckEntry::new(CheckKind::ErrorRates, CheckStatus::Warning)
                .with("components", components)
        };
        report.checks.push(entry);
    }

    fn check_disk(&self, report: &mut HealthReport) {
        let path = &self.guardian.paths().config_dir;
        let free_gb = match self.disk.free_bytes(path) {
            Ok(bytes) => bytes as f64 / GIB,
            Err(e) => {
                debug!(?path, error = %e, "disk probe failed");
                report.checks.push(
                    CheckEntry::new(CheckKind::DiskSpace, CheckStatus::Unknown)
                        .with("error", e.to_string()),
                );
                return;
            }
        };
        let free = (free_gb * 100.0).round() / 100.0;

        let entry = if free_gb < self.thresholds.critical_gb {
            let cleanup = self.reclaimer.cleanup();
            report.fixes_applied += 1;
            report.overall_healthy = false;
            let mut entry = CheckEntry::new(CheckKind::DiskSpace, CheckStatus::Critical)
                .with("free_gb", free);
            if let Ok(cleanup) = serde_json::to_value(&cleanup) {
                entry = entry.with("cleanup", cleanup);
            }
            entry
        } else if free_gb < self.thresholds.low_gb {
            CheckEntry::new(CheckKind::DiskSpace, CheckStatus::Low).with("free_gb", free)
        } else {
            CheckEntry::new(CheckKind::DiskSpace, CheckStatus::Ok).with("free_gb", free)
        };
        report.checks.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, ActionLog};
    use crate::circuit::BreakerPolicy;
    use crate::counter::ErrorCounter;
    use mender_core::{AppPaths, YamlConfigManager};
    use mender_store::RedbMaintenance;
    use std::time::Duration;

    struct FixedDisk(u64);

    impl DiskProbe for FixedDisk {
        fn free_bytes(&self, _: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    struct Harness {
        runner: HealthCheckRunner,
        paths: AppPaths,
        counter: Arc<ErrorCounter>,
        circuits: Arc<CircuitBreakerRegistry>,
        log: Arc<ActionLog>,
    }

    fn harness(root: &Path, free_bytes: u64) -> Harness {
        let paths = AppPaths::from_root(root);
        let log = Arc::new(ActionLog::default());
        let counter = Arc::new(ErrorCounter::new());
        let store = Arc::new(RedbMaintenance);
        let guardian = Arc::new(IntegrityGuardian::new(
            paths.clone(),
            Arc::new(YamlConfigManager::new(paths.config_file())),
            store.clone(),
            log.clone(),
        ));
        let reclaimer = Arc::new(ResourceReclaimer::new(
            paths.clone(),
            store,
            counter.clone(),
            log.clone(),
            Duration::from_secs(7 * 86_400),
        ));
        let circuits = Arc::new(CircuitBreakerRegistry::new(log.clone()));
        let runner = HealthCheckRunner::new(
            guardian,
            reclaimer,
            circuits.clone(),
            Arc::new(ErrorPatternAnalyzer::new(counter.clone())),
            Arc::new(FixedDisk(free_bytes)),
            DiskSettings::default(),
        );
        Harness {
            runner,
            paths,
            counter,
            circuits,
            log,
        }
    }

    const PLENTY: u64 = 50 * 1024 * 1024 * 1024;

    #[test]
    fn check_names_round_trip() {
        for kind in CheckKind::ALL {
            assert_eq!(kind.as_str().parse::<CheckKind>().unwrap(), kind);
        }
        assert!(matches!(
            "load_average".parse::<CheckKind>(),
            Err(HealError::UnknownCheck(ref n)) if n == "load_average"
        ));
    }

    #[test]
    fn fresh_layout_is_fixed_and_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(&dir.path().join("agent"), PLENTY);
        let report = h.runner.run();

        assert!(report.overall_healthy);
        assert_eq!(report.fixes_applied, 4);
        assert_eq!(report.entries(CheckKind::Directories).count(), 4);
        let db = report.entries(CheckKind::Database).next().unwrap();
        assert_eq!(db.status, CheckStatus::Missing);
        let disk = report.entries(CheckKind::DiskSpace).next().unwrap();
        assert_eq!(disk.status, CheckStatus::Ok);
        assert_eq!(disk.details["free_gb"], 50.0);

        let second = h.runner.run();
        assert_eq!(second.fixes_applied, 0);
    }

    #[test]
    fn corrupt_config_counts_as_a_fix() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), PLENTY);
        h.runner.run();
        std::fs::write(h.paths.config_file(), "- just\n- a list\n").unwrap();

        let report = h.runner.run_check("config").unwrap();
        let entry = &report.checks[0];
        assert_eq!(entry.status, CheckStatus::Corrupt);
        assert_eq!(entry.details["repaired"], true);
        assert_eq!(report.fixes_applied, 1);
        assert!(report.overall_healthy);
        assert_eq!(h.log.count_kind(ActionKind::ConfigRepair), 1);
    }

    #[test]
    fn damaged_database_flips_health_without_repair() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), PLENTY);
        h.runner.run();
        std::fs::write(h.paths.database_file(), b"junk").unwrap();

        let report = h.runner.run();
        assert!(!report.overall_healthy);
        let db = report.entries(CheckKind::Database).next().unwrap();
        assert_eq!(db.status, CheckStatus::Error);
        assert!(h.paths.database_file().exists());
        assert_eq!(h.log.count_kind(ActionKind::DbRepair), 0);
    }

    #[test]
    fn database_in_use_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), PLENTY);
        h.runner.run();
        let _store = mender_store::MemoryStore::open(&h.paths.database_file()).unwrap();

        let report = h.runner.run_check("database").unwrap();
        assert!(report.overall_healthy);
        assert_eq!(report.checks[0].status, CheckStatus::InUse);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["checks"][0]["status"], "in_use");
    }

    #[test]
    fn open_circuit_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), PLENTY);
        h.circuits
            .record_failure("provider", BreakerPolicy::new(1, Duration::from_secs(60)));

        let report = h.runner.run_check("circuit_breakers").unwrap();
        assert!(!report.overall_healthy);
        assert_eq!(report.checks[0].details["open"], json!(["provider"]));
    }

    #[test]
    fn error_rates_are_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), PLENTY);
        for _ in 0..6 {
            h.counter.increment("tools.exec");
        }
        let report = h.runner.run_check("error_rates").unwrap();
        assert!(report.overall_healthy);
        assert_eq!(report.checks[0].status, CheckStatus::Warning);
        assert_eq!(report.checks[0].details["components"]["tools"], 6);
    }

    #[test]
    fn low_disk_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 1024 * 1024 * 1024);
        let report = h.runner.run_check("disk_space").unwrap();
        assert!(report.overall_healthy);
        assert_eq!(report.checks[0].status, CheckStatus::Low);
        assert_eq!(report.fixes_applied, 0);
    }

    #[test]
    fn critical_disk_triggers_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 100 * 1024 * 1024);
        let report = h.runner.run_check("disk_space").unwrap();
        assert!(!report.overall_healthy);
        assert_eq!(report.fixes_applied, 1);
        let entry = &report.checks[0];
        assert_eq!(entry.status, CheckStatus::Critical);
        assert!(entry.details.contains_key("cleanup"));
        assert_eq!(h.log.count_kind(ActionKind::Cleanup), 1);
    }

    #[test]
    fn report_serializes_flat_entries() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), PLENTY);
        let report = h.runner.run_check("disk_space").unwrap();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["checks"][0]["check"], "disk_space");
        assert_eq!(value["checks"][0]["status"], "ok");
        assert!(value["checks"][0]["free_gb"].is_number());
    }

    #[cfg(unix)]
    #[test]
    fn statvfs_reads_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatvfsProbe.free_bytes(dir.path()).is_ok());
        assert!(StatvfsProbe.free_bytes(&dir.path().join("absent")).is_err());
    }
}
