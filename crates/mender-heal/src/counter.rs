//! Per-(component, operation) failure tally.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

/// Key under which failures of `operation` in `component` are counted.
pub fn error_key(component: &str, operation: &str) -> String {
    format!("{component}.{operation}")
}

/// Failure counts keyed by `"{component}.{operation}"`.
///
/// Incremented on failure and reset to 0 on success. Entries never expire
/// on their own; the reclaimer prunes the ones sitting at zero.
#[derive(Default)]
pub struct ErrorCounter {
    counts: Mutex<HashMap<String, u32>>,
}

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the count for `key` and return the new value.
    pub fn increment(&self, key: &str) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn reset(&self, key: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(key) {
            *count = 0;
        }
    }

    pub fn get(&self, key: &str) -> u32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Sorted copy of every entry, zeros included.
    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.counts
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Drop zero entries and release spare capacity. Returns entries removed.
    pub fn prune_zeros(&self) -> usize {
        let mut counts = self.counts.lock();
        let before = counts.len();
        counts.retain(|_, count| *count > 0);
        counts.shrink_to_fit();
        before - counts.len()
    }
}
