//! Bounded ring of completed tool calls.
//!
//! Serves three consumers: repetition detection (validators and inspectors
//! scan a "last K" window), failure-count gating, and aggregate statistics
//! for the session summary and doctor output.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use maestro_core::ErrorKind;

use crate::ToolResult;

pub const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    pub provider: String,
    pub raw_name: String,
    pub qualified_name: String,
    pub parameters: Map<String, Value>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate per-tool statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStats {
    pub qualified_name: String,
    pub total: usize,
    pub failures: usize,
    pub mean_duration_ms: u64,
}

pub struct CallHistory {
    entries: Mutex<VecDeque<CallHistoryEntry>>,
    capacity: usize,
}

impl CallHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, result: &ToolResult, parameters: &Map<String, Value>) {
        let entry = CallHistoryEntry {
            provider: result.provider.clone(),
            raw_name: result.raw_name.clone(),
            qualified_name: format!("{}__{}", result.provider, result.raw_name),
            parameters: parameters.clone(),
            success: result.success,
            error_kind: result.error.as_ref().map(|error| error.kind()),
            duration_ms: result.duration_ms,
            timestamp: result.timestamp,
        };
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// The most recent `window` entries, oldest first.
    pub fn recent(&self, window: usize) -> Vec<CallHistoryEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .skip(entries.len().saturating_sub(window))
            .cloned()
            .collect()
    }

    /// Completed calls in the window with the same qualified name and
    /// canonically equal parameters.
    pub fn count_exact(
        &self,
        qualified_name: &str,
        parameters: &Map<String, Value>,
        window: usize,
    ) -> usize {
        self.recent(window)
            .iter()
            .filter(|entry| {
                entry.qualified_name == qualified_name && entry.parameters == *parameters
            })
            .count()
    }

    /// Length of the trailing run of the same qualified name in the window.
    pub fn consecutive_tail(&self, qualified_name: &str, window: usize) -> usize {
        self.recent(window)
            .iter()
            .rev()
            .take_while(|entry| entry.qualified_name == qualified_name)
            .count()
    }

    /// Failures recorded for one (provider, raw_name) pair across the ring.
    pub fn failure_count(&self, provider: &str, raw_name: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| {
                !entry.success && entry.provider == provider && entry.raw_name == raw_name
            })
            .count()
    }

    /// Aggregates per qualified tool, sorted by call count descending.
    pub fn stats(&self) -> Vec<ToolStats> {
        let entries = self.entries.lock().unwrap();
        let mut grouped: HashMap<&str, (usize, usize, u64)> = HashMap::new();
        for entry in entries.iter() {
            let slot = grouped.entry(&entry.qualified_name).or_default();
            slot.0 += 1;
            if !entry.success {
                slot.1 += 1;
            }
            slot.2 += entry.duration_ms;
        }
        let mut stats: Vec<ToolStats> = grouped
            .into_iter()
            .map(|(name, (total, failures, duration_sum))| ToolStats {
                qualified_name: name.to_string(),
                total,
                failures,
                mean_duration_ms: duration_sum / total as u64,
            })
            .collect();
        stats.sort_by(|a, b| b.total.cmp(&a.total).then(a.qualified_name.cmp(&b.qualified_name)));
        stats
    }
}

impl Default for CallHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(provider: &str, raw: &str, success: bool, duration_ms: u64) -> ToolResult {
        ToolResult {
            request_id: 0,
            success,
            content: String::new(),
            error: None,
            duration_ms,
            provider: provider.to_string(),
            raw_name: raw.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn ring_is_bounded() {
        let history = CallHistory::new(3);
        for index in 0..5 {
            history.record(
                &result("p", "t", true, index),
                &params(&[("i", &index.to_string())]),
            );
        }
        assert_eq!(history.len(), 3);
        // Oldest entries fell off.
        let recent = history.recent(10);
        assert_eq!(recent[0].parameters["i"], "2");
    }

    #[test]
    fn count_exact_matches_name_and_parameters() {
        let history = CallHistory::default();
        let selector = params(&[("selector", "#a")]);
        for _ in 0..3 {
            history.record(&result("playwright", "click", true, 5), &selector);
        }
        history.record(&result("playwright", "click", true, 5), &params(&[("selector", "#b")]));

        assert_eq!(history.count_exact("playwright__click", &selector, 20), 3);
        assert_eq!(
            history.count_exact("playwright__click", &params(&[("selector", "#b")]), 20),
            1
        );
        assert_eq!(history.count_exact("playwright__hover", &selector, 20), 0);
    }

    #[test]
    fn consecutive_tail_counts_trailing_run() {
        let history = CallHistory::default();
        history.record(&result("fs", "read_file", true, 1), &params(&[]));
        history.record(&result("playwright", "click", true, 1), &params(&[]));
        history.record(&result("playwright", "click", true, 1), &params(&[]));
        assert_eq!(history.consecutive_tail("playwright__click", 20), 2);
        assert_eq!(history.consecutive_tail("fs__read_file", 20), 0);
    }

    #[test]
    fn failure_count_and_stats() {
        let history = CallHistory::default();
        history.record(&result("fs", "read_file", true, 10), &params(&[]));
        history.record(&result("fs", "read_file", false, 20), &params(&[]));
        history.record(&result("fs", "read_file", false, 30), &params(&[]));
        history.record(&result("web", "fetch", true, 100), &params(&[]));

        assert_eq!(history.failure_count("fs", "read_file"), 2);
        assert_eq!(history.failure_count("web", "fetch"), 0);

        let stats = history.stats();
        assert_eq!(stats[0].qualified_name, "fs__read_file");
        assert_eq!(stats[0].total, 3);
        assert_eq!(stats[0].failures, 2);
        assert_eq!(stats[0].mean_duration_ms, 20);
    }
}
