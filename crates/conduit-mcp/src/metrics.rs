//! Per-tool usage counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// How many tools keep individual stats.
const TRACKED_TOOLS: usize = 10;

/// Usage of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    pub calls: u64,
    pub avg_latency_ms: f64,
    pub last_used: DateTime<Utc>,
}

/// Call outcomes for one client; per-tool entries are capped at the ten most used.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageMetrics {
    pub tools: HashMap<String, ToolUsage>,
    pub successes: u64,
    pub failures: u64,
}

impl UsageMetrics {
    /// Count a successful call and fold its latency into the tool's mean.
    pub fn record_success(&mut self, tool: &str, latency_ms: f64) {
        self.successes += 1;
        let usage = self.tools.entry(tool.to_string()).or_insert_with(|| ToolUsage {
            calls: 0,
            avg_latency_ms: 0.0,
            last_used: Utc::now(),
        });
        usage.calls += 1;
        usage.avg_latency_ms += (latency_ms - usage.avg_latency_ms) / usage.calls as f64;
        usage.last_used = Utc::now();
        self.trim();
    }

    /// Count a failed call.
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Successes over all calls, or `None` before the first call.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        (total > 0).then(|| self.successes as f64 / total as f64)
    }

    /// Keeps the most-called tools, most recent first among equals.
    fn trim(&mut self) {
        if self.tools.len() <= TRACKED_TOOLS {
            return;
        }
        let mut ranked: Vec<(String, u64, DateTime<Utc>)> = self
            .tools
            .iter()
            .map(|(name, u)| (name.clone(), u.calls, u.last_used))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        for (name, _, _) in ranked.into_iter().skip(TRACKED_TOOLS) {
            self.tools.remove(&name);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        let mut m = UsageMetrics::default();
        m.record_success("echo", 10.0);
        m.record_success("echo", 30.0);
        let usage = &m.tools["echo"];
        assert_eq!(usage.calls, 2);
        assert!((usage.avg_latency_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(m.success_rate(), Some(1.0));
    }

    #[test]
    fn test_trim_keeps_top_ten() {
        let mut m = UsageMetrics::default();
        for _ in 0..3 {
            m.record_success("busy", 1.0);
        }
        for i in 0..12 {
            m.record_success(&format!("tool{i}"), 1.0);
        }
        assert_eq!(m.tools.len(), 10);
        assert!(m.tools.contains_key("busy"));
    }

    #[test]
    fn test_success_rate_without_history() {
        let mut m = UsageMetrics::default();
        assert_eq!(m.success_rate(), None);
        m.record_failure();
        assert_eq!(m.success_rate(), Some(0.0));
    }
}
