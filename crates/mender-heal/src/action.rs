//! Bounded audit trail of every self-healing action.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Default number of actions kept before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 500;

/// What kind of self-healing step was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Retrying,
    Fallback,
    CircuitOpen,
    DirCreate,
    ConfigVerify,
    ConfigBackup,
    ConfigRepair,
    DbVerify,
    DbBackup,
    DbRepair,
    DbRecreate,
    Cleanup,
    Backup,
    Restore,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Retrying => "retrying",
            ActionKind::Fallback => "fallback",
            ActionKind::CircuitOpen => "circuit_open",
            ActionKind::DirCreate => "dir_create",
            ActionKind::ConfigVerify => "config_verify",
            ActionKind::ConfigBackup => "config_backup",
            ActionKind::ConfigRepair => "config_repair",
            ActionKind::DbVerify => "db_verify",
            ActionKind::DbBackup => "db_backup",
            ActionKind::DbRepair => "db_repair",
            ActionKind::DbRecreate => "db_recreate",
            ActionKind::Cleanup => "cleanup",
            ActionKind::Backup => "backup",
            ActionKind::Restore => "restore",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded action. Never mutated once it is in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub description: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub details: Map<String, Value>,
    pub error: String,
}

impl HealingAction {
    pub fn new(kind: ActionKind, description: impl Into<String>, success: bool) -> Self {
        Self {
            kind,
            description: description.into(),
            success,
            timestamp: Utc::now(),
            details: Map::new(),
            error: String::new(),
        }
    }

    /// Attach details; non-object values are stored under `"value"`.
    pub fn with_details(mut self, details: Value) -> Self {
        match details {
            Value::Object(map) => self.details = map,
            Value::Null => {}
            other => {
                self.details.insert("value".to_string(), other);
            }
        }
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = error.to_string();
        self
    }
}

struct Entries {
    actions: VecDeque<HealingAction>,
    /// Actions ever recorded, including ones already dropped.
    recorded: u64,
}

/// Bounded FIFO of healing actions, shared by every engine component.
pub struct ActionLog {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl ActionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries {
                actions: VecDeque::with_capacity(capacity.min(64)),
                recorded: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append an action, dropping the oldest beyond capacity, and mirror it to tracing.
    pub fn record(&self, action: HealingAction) {
        if action.success {
            info!(kind = %action.kind, "{}", action.description);
        } else if action.error.is_empty() {
            warn!(kind = %action.kind, "{}", action.description);
        } else {
            warn!(kind = %action.kind, error = %action.error, "{}", action.description);
        }

        let mut entries = self.entries.lock();
        entries.actions.push_back(action);
        entries.recorded += 1;
        while entries.actions.len() > self.capacity {
            entries.actions.pop_front();
        }
    }

    /// The newest `limit` actions, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<HealingAction> {
        let entries = self.entries.lock();
        let skip = entries.actions.len().saturating_sub(limit);
        entries.actions.iter().skip(skip).cloned().collect()
    }

    /// Total actions ever recorded (monotonic, unaffected by eviction).
    pub fn recorded(&self) -> u64 {
        self.entries.lock().recorded
    }

    /// Actions recorded after the `since` watermark that are still retained.
    pub fn since(&self, since: u64) -> Vec<HealingAction> {
        let entries = self.entries.lock();
        let fresh = entries.recorded.saturating_sub(since);
        let fresh = usize::try_from(fresh).unwrap_or(usize::MAX);
        let skip = entries.actions.len().saturating_sub(fresh);
        entries.actions.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_kind(&self, kind: ActionKind) -> usize {
        self.entries
            .lock()
            .actions
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }

    /// `(successes, failures)` among retained actions.
    pub fn outcome_counts(&self) -> (usize, usize) {
        let entries = self.entries.lock();
        let ok = entries.actions.iter().filter(|a| a.success).count();
        (ok, entries.actions.len() - ok)
    }

    /// Release spare capacity. Returns the number of retained actions.
    pub fn shrink(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.actions.shrink_to_fit();
        entries.actions.len()
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(n: usize) -> HealingAction {
        HealingAction::new(ActionKind::Cleanup, format!("action {n}"), true)
    }

    #[test]
    fn keeps_newest_within_capacity() {
        let log = ActionLog::new(3);
        for n in 0..5 {
            log.record(action(n));
        }
        assert_eq!(log.len(), 3);
        let descriptions: Vec<_> = log.recent(10).into_iter().map(|a| a.description).collect();
        assert_eq!(descriptions, vec!["action 2", "action 3", "action 4"]);
        assert_eq!(log.recorded(), 5);
    }

    #[test]
    fn default_capacity_is_500() {
        let log = ActionLog::default();
        for n in 0..510 {
            log.record(action(n));
        }
        assert_eq!(log.len(), 500);
        assert_eq!(log.recent(1)[0].description, "action 509");
    }

    #[test]
    fn recent_limits_from_the_end() {
        let log = ActionLog::new(10);
        for n in 0..4 {
            log.record(action(n));
        }
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].description, "action 3");
    }

    #[test]
    fn since_returns_only_new_actions() {
        let log = ActionLog::new(10);
        log.record(action(0));
        let mark = log.recorded();
        log.record(action(1));
        log.record(action(2));
        let fresh = log.since(mark);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].description, "action 1");
    }

    #[test]
    fn counts_by_kind_and_outcome() {
        let log = ActionLog::new(10);
        log.record(HealingAction::new(ActionKind::Retrying, "r", false).with_error("boom"));
        log.record(HealingAction::new(ActionKind::Retrying, "r", false));
        log.record(HealingAction::new(ActionKind::Fallback, "f", true));
        assert_eq!(log.count_kind(ActionKind::Retrying), 2);
        assert_eq!(log.count_kind(ActionKind::Fallback), 1);
        assert_eq!(log.outcome_counts(), (1, 2));
    }

    #[test]
    fn serializes_with_type_field() {
        let action = HealingAction::new(ActionKind::CircuitOpen, "opened", true)
            .with_details(json!({"cooldown_seconds": 60}));
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "circuit_open");
        assert_eq!(value["details"]["cooldown_seconds"], 60);
        assert_eq!(value["error"], "");
    }
}
