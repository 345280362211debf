//! Periodic health checks and backups for the `run` command.

use std::time::Duration;

use mender_core::settings::ScheduleSettings;
use mender_heal::Resilience;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// What a scheduler run did before shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub health_checks: u32,
    pub backups: u32,
}

pub struct MaintenanceScheduler {
    engine: Resilience,
    health_every: Duration,
    backup_every: Duration,
}

impl MaintenanceScheduler {
    pub fn new(engine: Resilience, health_every: Duration, backup_every: Duration) -> Self {
        Self {
            engine,
            health_every,
            backup_every,
        }
    }

    pub fn from_settings(engine: Resilience, schedule: &ScheduleSettings) -> Self {
        Self::new(
            engine,
            Duration::from_secs(schedule.health_interval_secs.max(1)),
            Duration::from_secs(schedule.backup_interval_secs.max(1)),
        )
    }

    /// Tick until `shutdown` flips. The first run of each job waits one full interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        info!(
            health_secs = self.health_every.as_secs(),
            backup_secs = self.backup_every.as_secs(),
            "maintenance scheduler started"
        );
        let mut health = interval_at(Instant::now() + self.health_every, self.health_every);
        let mut backup = interval_at(Instant::now() + self.backup_every, self.backup_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        backup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = RunSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("maintenance scheduler shutting down");
                    break;
                }
                _ = health.tick() => {
                    if self.health_tick().await {
                        summary.health_checks += 1;
                    }
                }
                _ = backup.tick() => {
                    if self.backup_tick().await {
                        summary.backups += 1;
                    }
                }
            }
        }
        summary
    }

    /// The engine does blocking file I/O, so jobs run off the async workers.
    async fn health_tick(&self) -> bool {
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.health_check()).await {
            Ok(report) => {
                if !report.overall_healthy {
                    warn!(fixes = report.fixes_applied, "scheduled health check found problems");
                }
                true
            }
            Err(e) => {
                error!(error = %e, "scheduled health check panicked");
                false
            }
        }
    }

    async fn backup_tick(&self) -> bool {
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.backup()).await {
            Ok(Ok(path)) => {
                info!(?path, "scheduled backup written");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "scheduled backup failed");
                false
            }
            Err(e) => {
                error!(error = %e, "scheduled backup panicked");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::AppPaths;

    fn engine(root: &std::path::Path) -> Resilience {
        let engine = Resilience::builder(AppPaths::from_root(root)).build();
        engine.initialize();
        engine
    }

    #[tokio::test]
    async fn runs_both_jobs_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let scheduler = MaintenanceScheduler::new(
            engine.clone(),
            Duration::from_millis(40),
            Duration::from_millis(100),
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(true).unwrap();
        let summary = handle.await.unwrap();

        assert!(summary.health_checks >= 2, "{summary:?}");
        assert!(summary.backups >= 1, "{summary:?}");
        assert_eq!(engine.list_backups().len() as u32, summary.backups.min(5));
    }

    #[tokio::test]
    async fn shutdown_before_first_tick_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = MaintenanceScheduler::from_settings(
            engine(dir.path()),
            &ScheduleSettings::default(),
        );
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = scheduler.run(rx).await;
        assert_eq!(summary, RunSummary::default());
    }
}
