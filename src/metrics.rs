//! Prometheus metrics for the lockdown engine
//!
//! Metrics live in the default registry. [`render`] produces the text
//! exposition that `examlock run --metrics <file>` writes when the session
//! ends. No listener is opened.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Process Enforcement Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Violations detected, by classification.
    ///
    /// Labels:
    /// - classification: "pattern" (interpreter escape) or "unknown" (not allowlisted)
    pub static ref VIOLATIONS: CounterVec = register_counter_vec!(
        "examlock_violations_total",
        "Process violations detected during a lockdown session",
        &["classification"]
    ).expect("failed to register VIOLATIONS metric");

    /// Processes terminated, by how they ended.
    ///
    /// Labels:
    /// - method: "graceful" (exited after SIGTERM) or "forced" (needed SIGKILL)
    pub static ref PROCESSES_TERMINATED: CounterVec = register_counter_vec!(
        "examlock_processes_terminated_total",
        "Processes terminated by the enforcement policy",
        &["method"]
    ).expect("failed to register PROCESSES_TERMINATED metric");

    /// Processes that could not be inspected and were left running.
    pub static ref UNCLASSIFIED_PROCESSES: Counter = register_counter!(
        "examlock_unclassified_processes_total",
        "Processes skipped because they could not be inspected"
    ).expect("failed to register UNCLASSIFIED_PROCESSES metric");

    /// Size of the current known-process set.
    pub static ref KNOWN_PROCESSES: Gauge = register_gauge!(
        "examlock_known_processes",
        "Number of process ids seen in the latest scan"
    ).expect("failed to register KNOWN_PROCESSES metric");

    /// Wall time of one watcher cycle.
    pub static ref SCAN_DURATION: Histogram = register_histogram!(
        "examlock_scan_duration_seconds",
        "Time to enumerate and classify the process table",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).expect("failed to register SCAN_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // System Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// External commands that failed, by program.
    pub static ref COMMAND_FAILURES: CounterVec = register_counter_vec!(
        "examlock_command_failures_total",
        "External commands that exited non-zero or could not run",
        &["program"]
    ).expect("failed to register COMMAND_FAILURES metric");

    /// Lockdown state as a number.
    ///
    /// 0 = inactive, 1 = network active, 2 = process active,
    /// 3 = fully locked, 4 = stopping
    pub static ref LOCKDOWN_STATE: Gauge = register_gauge!(
        "examlock_lockdown_state",
        "Current lockdown state (0 inactive .. 3 fully locked, 4 stopping)"
    ).expect("failed to register LOCKDOWN_STATE metric");
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        VIOLATIONS.with_label_values(&["unknown"]).inc();
        LOCKDOWN_STATE.set(0.0);
        let text = render();
        assert!(text.contains("examlock_violations_total"));
        assert!(text.contains("examlock_lockdown_state"));
    }
}
