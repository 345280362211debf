//! mender-heal: the agent's resilience engine.
//!
//! Gives every other subsystem automatic retry, failure isolation, and
//! repair of the process's own environment (config document, database,
//! directory layout), plus rotating backups and error-pattern reporting.
//!
//! # Architecture
//!
//! ```text
//! Resilience (cloned handle, built once at startup)
//!   ├── SafeExecutor ── retry + backoff + fallback
//!   │     ├── ErrorCounter      ("component.operation" → failures)
//!   │     └── CircuitBreakerRegistry (optional guard per call)
//!   ├── IntegrityGuardian ── dirs, config.yaml, mender.redb
//!   ├── ResourceReclaimer ── counter sweep, log purge, compaction
//!   ├── BackupCoordinator ── snapshots, manifest, rotation, restore
//!   ├── ErrorPatternAnalyzer ── per-component totals, fix suggestions
//!   └── HealthCheckRunner ── six checks, auto-fixes via the above
//!
//!  every component ──▶ ActionLog (bounded audit trail, mirrored to tracing)
//! ```
//!
//! # Fail-soft
//!
//! Operation failures become fallback values; repair failures become
//! logged actions and a degraded subsystem. Only backup I/O, cancellation
//! of an async retry, and unknown check names surface as [`HealError`].

pub mod action;
pub mod backup;
pub mod circuit;
pub mod counter;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod integrity;
pub mod patterns;
pub mod reclaim;

pub use action::{ActionKind, ActionLog, HealingAction};
pub use backup::{BackupCoordinator, BackupManifest};
pub use circuit::{BreakerPolicy, CircuitBreakerRegistry, CircuitError, CircuitSnapshot, CircuitState};
pub use counter::{error_key, ErrorCounter};
pub use engine::{EngineStats, Resilience, ResilienceBuilder, DEFAULT_RECENT_ACTIONS};
pub use error::{HealError, HealResult};
pub use executor::{Call, RetryPolicy, SafeExecutor};
pub use health::{CheckEntry, CheckKind, CheckStatus, DiskProbe, HealthCheckRunner, HealthReport, StatvfsProbe};
pub use integrity::{ConfigOutcome, DatabaseOutcome, GuardianReport, IntegrityGuardian};
pub use patterns::{ComponentErrors, ErrorPatternAnalyzer, FixSuggestion, Severity};
pub use reclaim::{CleanupReport, GcStats, ResourceReclaimer};
