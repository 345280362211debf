//! ErrorPatternAnalyzer: per-component view of the error counters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::counter::ErrorCounter;

/// Totals above this are `high` severity.
pub const HIGH_THRESHOLD: u32 = 10;
/// Totals above this (and up to [`HIGH_THRESHOLD`]) are `medium`.
pub const MEDIUM_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComponentErrors {
    pub total_errors: u32,
    pub operations: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Medium => f.write_str("medium"),
            Severity::High => f.write_str("high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixSuggestion {
    pub component: String,
    pub severity: Severity,
    pub message: String,
}

/// Group `"component.operation"` counts by component.
///
/// The component is everything before the first `.`; a key without one is
/// its own component with an empty operation name.
pub fn group_by_component(counts: &BTreeMap<String, u32>) -> BTreeMap<String, ComponentErrors> {
    let mut groups: BTreeMap<String, ComponentErrors> = BTreeMap::new();
    for (key, &count) in counts {
        let (component, operation) = key.split_once('.').unwrap_or((key.as_str(), ""));
        let group = groups.entry(component.to_string()).or_default();
        group.total_errors = group.total_errors.saturating_add(count);
        *group.operations.entry(operation.to_string()).or_insert(0) += count;
    }
    groups
}

pub fn severity_for(total_errors: u32) -> Option<Severity> {
    if total_errors > HIGH_THRESHOLD {
        Some(Severity::High)
    } else if total_errors > MEDIUM_THRESHOLD {
        Some(Severity::Medium)
    } else {
        None
    }
}

/// Suggestions for every component at or above medium, worst first.
pub fn suggestions(groups: &BTreeMap<String, ComponentErrors>) -> Vec<FixSuggestion> {
    let mut out: Vec<_> = groups
        .iter()
        .filter_map(|(component, errors)| {
            let severity = severity_for(errors.total_errors)?;
            let message = match severity {
                Severity::High => format!(
                    "{component} has failed {} times; check its configuration and dependencies",
                    errors.total_errors
                ),
                Severity::Medium => format!(
                    "{component} is failing intermittently ({} errors); monitor it",
                    errors.total_errors
                ),
            };
            Some(FixSuggestion {
                component: component.clone(),
                severity,
                message,
            })
        })
        .collect();
    out.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.component.cmp(&b.component)));
    out
}

/// Read-only analysis over the shared counter.
pub struct ErrorPatternAnalyzer {
    counter: Arc<ErrorCounter>,
}

impl ErrorPatternAnalyzer {
    pub fn new(counter: Arc<ErrorCounter>) -> Self {
        Self { counter }
    }

    pub fn patterns(&self) -> BTreeMap<String, ComponentErrors> {
        group_by_component(&self.counter.snapshot())
    }

    pub fn suggest_fixes(&self) -> Vec<FixSuggestion> {
        suggestions(&self.patterns())
    }

    /// Components whose total exceeds `threshold`.
    pub fn components_above(&self, threshold: u32) -> Vec<(String, u32)> {
        self.patterns()
            .into_iter()
            .filter(|(_, e)| e.total_errors > threshold)
            .map(|(c, e)| (c, e.total_errors))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn groups_by_component_prefix() {
        let groups = group_by_component(&counts(&[
            ("memory.load", 2),
            ("memory.save", 3),
            ("provider.chat", 1),
            ("orphan", 4),
        ]));
        assert_eq!(groups["memory"].total_errors, 5);
        assert_eq!(groups["memory"].operations["save"], 3);
        assert_eq!(groups["provider"].total_errors, 1);
        assert_eq!(groups["orphan"].operations[""], 4);
    }

    #[test]
    fn severity_boundaries() {
        assert_eq!(severity_for(3), None);
        assert_eq!(severity_for(4), Some(Severity::Medium));
        assert_eq!(severity_for(10), Some(Severity::Medium));
        assert_eq!(severity_for(11), Some(Severity::High));
    }

    #[test]
    fn suggestions_are_worst_first() {
        let groups = group_by_component(&counts(&[
            ("a.x", 4),
            ("b.x", 20),
            ("c.x", 1),
            ("d.x", 6),
        ]));
        let fixes = suggestions(&groups);
        let order: Vec<_> = fixes.iter().map(|f| (f.component.as_str(), f.severity)).collect();
        assert_eq!(
            order,
            vec![("b", Severity::High), ("a", Severity::Medium), ("d", Severity::Medium)]
        );
    }

    #[test]
    fn analyzer_reads_live_counter() {
        let counter = Arc::new(ErrorCounter::new());
        let analyzer = ErrorPatternAnalyzer::new(counter.clone());
        assert!(analyzer.suggest_fixes().is_empty());

        for _ in 0..12 {
            counter.increment("tools.exec");
        }
        counter.increment("web.fetch");
        let fixes = analyzer.suggest_fixes();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].severity, Severity::High);
        assert_eq!(analyzer.components_above(5), vec![("tools".to_string(), 12)]);
        // Analysis leaves the counters alone.
        assert_eq!(counter.get("tools.exec"), 12);
    }
}
