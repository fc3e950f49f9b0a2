//! Violation handling
//!
//! The watcher detects; this module decides and acts. The mode is a single
//! atomic the orchestrator flips, read once per evaluation:
//!
//! ```text
//!             ┌── Allowed ──────────────► (nothing)
//! classify ───┤
//!             └── Violation ─► append ViolationEvent ─┬─ LogOnly ─► audit
//!                                                     └─ Enforce ─► SIGTERM
//!                                                                   wait ≤ grace
//!                                                                   SIGKILL if alive
//! ```
//!
//! Detection and termination are separate steps so the watcher can end a
//! whole cycle's violators as one batch: every pid gets SIGTERM, then one
//! shared grace period runs, then the survivors get SIGKILL. A batch blocks
//! for at most grace + `KILL_WAIT` regardless of its size.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, Auditor};
use crate::error::{LockdownError, Result};
use crate::metrics::{PROCESSES_TERMINATED, UNCLASSIFIED_PROCESSES, VIOLATIONS};
use crate::process::allowlist::AllowlistStore;
use crate::process::classify::{classify, Classification};
use crate::process::table::{stat_alive, ProcessRecord};

/// How long to wait for the kernel to reap a SIGKILLed process.
const KILL_WAIT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    LogOnly,
    Enforce,
}

impl EnforcementMode {
    fn as_u8(self) -> u8 {
        match self {
            EnforcementMode::LogOnly => 0,
            EnforcementMode::Enforce => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 1 {
            EnforcementMode::Enforce
        } else {
            EnforcementMode::LogOnly
        }
    }
}

/// One detected violation. Never modified after it is appended.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub process: ProcessRecord,
    pub classification: Classification,
    pub reason: String,
    /// Mode at detection time was Enforce
    pub enforced: bool,
}

/// How a termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Forced,
    /// Was gone before the first signal
    AlreadyGone,
}

/// Signal delivery and liveness, behind a seam for tests.
pub trait Terminator: Send + Sync {
    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// `kill(2)` and `/proc/<pid>/stat`. Zombies count as dead.
pub struct SignalTerminator;

impl Terminator for SignalTerminator {
    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()> {
        let pid = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
        kill(Pid::from_raw(pid), signal)
    }

    fn is_alive(&self, pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|raw| stat_alive(&raw))
            .unwrap_or(false)
    }
}

pub struct EnforcementPolicy {
    mode: AtomicU8,
    allowlist: Arc<AllowlistStore>,
    terminator: Arc<dyn Terminator>,
    grace_period: Duration,
    auditor: Arc<Auditor>,
    next_seq: AtomicU64,
    violations: Mutex<Vec<ViolationEvent>>,
    terminated: AtomicU64,
}

impl EnforcementPolicy {
    /// Starts in log-only mode.
    pub fn new(
        allowlist: Arc<AllowlistStore>,
        terminator: Arc<dyn Terminator>,
        grace_period: Duration,
        auditor: Arc<Auditor>,
    ) -> Self {
        Self {
            mode: AtomicU8::new(EnforcementMode::LogOnly.as_u8()),
            allowlist,
            terminator,
            grace_period,
            auditor,
            next_seq: AtomicU64::new(1),
            violations: Mutex::new(Vec::new()),
            terminated: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> EnforcementMode {
        EnforcementMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_mode(&self, mode: EnforcementMode) {
        let previous = EnforcementMode::from_u8(self.mode.swap(mode.as_u8(), Ordering::SeqCst));
        if previous != mode {
            info!(from = ?previous, to = ?mode, "enforcement mode changed");
        }
    }

    pub fn allowlist(&self) -> &AllowlistStore {
        &self.allowlist
    }

    /// Classify a new process and record a violation. Never signals.
    pub fn detect(&self, record: ProcessRecord) -> Option<ViolationEvent> {
        let verdict = classify(&record, &self.allowlist);
        if !verdict.classification.is_violation() {
            debug!(pid = record.pid, name = %record.name, "allowed");
            return None;
        }

        let enforced = self.mode() == EnforcementMode::Enforce;
        let event = ViolationEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            process: record,
            classification: verdict.classification,
            reason: verdict.reason,
            enforced,
        };
        self.append(event.clone());

        VIOLATIONS.with_label_values(&[event.classification.label()]).inc();
        self.auditor.emit(AuditEvent::Violation {
            pid: event.process.pid,
            name: event.process.name.clone(),
            path: event.process.exe.clone(),
            classification: event.classification,
            reason: event.reason.clone(),
            enforced,
        });
        Some(event)
    }

    /// Classify a new process and act on a violation.
    ///
    /// Blocking: in enforce mode this waits up to the grace period.
    pub fn evaluate(&self, record: ProcessRecord) -> Option<ViolationEvent> {
        let event = self.detect(record)?;
        self.enforce_all(std::slice::from_ref(&event));
        Some(event)
    }

    fn append(&self, event: ViolationEvent) {
        match self.violations.lock() {
            Ok(mut violations) => violations.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }

    /// Terminate the processes behind the enforced events as one batch.
    pub fn enforce_all(&self, events: &[ViolationEvent]) {
        let targets: Vec<&ProcessRecord> = events
            .iter()
            .filter(|e| e.enforced)
            .map(|e| &e.process)
            .collect();
        if targets.is_empty() {
            return;
        }

        let pids: Vec<u32> = targets.iter().map(|p| p.pid).collect();
        let outcomes = self.terminate_all(&pids);
        for (process, outcome) in targets.into_iter().zip(outcomes) {
            self.report(process, outcome);
        }
    }

    fn report(&self, process: &ProcessRecord, outcome: Result<Termination>) {
        match outcome {
            Ok(Termination::AlreadyGone) => {
                debug!(pid = process.pid, "violator exited before termination");
            }
            Ok(outcome) => {
                let forced = outcome == Termination::Forced;
                PROCESSES_TERMINATED
                    .with_label_values(&[if forced { "forced" } else { "graceful" }])
                    .inc();
                self.auditor.emit(AuditEvent::Terminated {
                    pid: process.pid,
                    name: process.name.clone(),
                    forced,
                });
            }
            Err(e) => {
                // Fail-open for this process only.
                error!(pid = process.pid, name = %process.name, error = %e, "could not terminate violator");
                self.auditor.emit(AuditEvent::TerminationFailed {
                    pid: process.pid,
                    name: process.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    pub fn terminate(&self, pid: u32) -> Result<Termination> {
        self.terminate_all(&[pid])
            .into_iter()
            .next()
            .unwrap_or(Ok(Termination::AlreadyGone))
    }

    /// [`terminate`](Self::terminate) for many pids with one shared grace
    /// period. Outcomes come back in input order.
    pub fn terminate_all(&self, pids: &[u32]) -> Vec<Result<Termination>> {
        let mut outcomes: Vec<Result<Termination>> = pids.iter().map(|_| Ok(Termination::AlreadyGone)).collect();

        let mut signalled = Vec::new();
        for (i, &pid) in pids.iter().enumerate() {
            match self.terminator.signal(pid, Signal::SIGTERM) {
                Ok(()) => signalled.push(i),
                Err(Errno::ESRCH) => {}
                Err(errno) => outcomes[i] = Err(signal_error(pid, errno, "signal")),
            }
        }

        let survivors = self.wait_for_exit(pids, &signalled, self.grace_period);
        for &i in signalled.iter().filter(|i| !survivors.contains(i)) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            info!(pid = pids[i], "violator terminated");
            outcomes[i] = Ok(Termination::Graceful);
        }

        let mut killed = Vec::new();
        for &i in &survivors {
            let pid = pids[i];
            warn!(pid = pid, grace = ?self.grace_period, "violator ignored SIGTERM, sending SIGKILL");
            match self.terminator.signal(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => killed.push(i),
                Err(errno) => outcomes[i] = Err(signal_error(pid, errno, "kill")),
            }
        }
        for i in self.wait_for_exit(pids, &killed, KILL_WAIT) {
            warn!(pid = pids[i], "process still present after SIGKILL");
        }
        for &i in &killed {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            info!(pid = pids[i], "violator killed");
            outcomes[i] = Ok(Termination::Forced);
        }

        outcomes
    }

    /// Poll until every `pids[i]` for `i` in `waiting` is gone or `timeout`
    /// passes. Returns the indices still alive.
    fn wait_for_exit(&self, pids: &[u32], waiting: &[usize], timeout: Duration) -> Vec<usize> {
        let start = Instant::now();
        let mut alive = waiting.to_vec();
        loop {
            alive.retain(|&i| self.terminator.is_alive(pids[i]));
            if alive.is_empty() || start.elapsed() >= timeout {
                return alive;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// A process that could not be inspected was left running.
    pub fn record_unclassifiable(&self, pid: u32, reason: &str) {
        UNCLASSIFIED_PROCESSES.inc();
        self.auditor.emit(AuditEvent::Unclassifiable {
            pid,
            reason: reason.to_string(),
        });
    }

    pub fn violations(&self) -> Vec<ViolationEvent> {
        match self.violations.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn violation_count(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    pub fn terminated_count(&self) -> u64 {
        self.terminated.load(Ordering::SeqCst)
    }
}

fn signal_error(pid: u32, errno: Errno, action: &str) -> LockdownError {
    match errno {
        Errno::EPERM => LockdownError::Permission {
            pid,
            reason: format!("not permitted to {} process", action),
        },
        other => LockdownError::Io(other.into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use std::collections::HashSet;

    /// Scripted terminator: records signals, processes in `stubborn` ignore
    /// SIGTERM, `protected` pids return EPERM.
    #[derive(Default)]
    pub struct FakeTerminator {
        pub signals: Mutex<Vec<(u32, Signal)>>,
        pub alive: Mutex<HashSet<u32>>,
        pub stubborn: HashSet<u32>,
        pub protected: HashSet<u32>,
    }

    impl FakeTerminator {
        pub fn with_alive(pids: &[u32]) -> Self {
            Self {
                alive: Mutex::new(pids.iter().copied().collect()),
                ..Self::default()
            }
        }
    }

    impl Terminator for FakeTerminator {
        fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()> {
            self.signals.lock().unwrap().push((pid, signal));
            if self.protected.contains(&pid) {
                return Err(Errno::EPERM);
            }
            let mut alive = self.alive.lock().unwrap();
            if !alive.contains(&pid) {
                return Err(Errno::ESRCH);
            }
            if signal == Signal::SIGKILL || !self.stubborn.contains(&pid) {
                alive.remove(&pid);
            }
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    fn policy(terminator: FakeTerminator) -> (EnforcementPolicy, Arc<FakeTerminator>, Arc<MemoryAuditSink>) {
        let mut allowlist = AllowlistStore::new();
        allowlist.add_entry("sleep", None, false).unwrap();
        let terminator = Arc::new(terminator);
        let memory = Arc::new(MemoryAuditSink::new());
        let policy = EnforcementPolicy::new(
            Arc::new(allowlist),
            terminator.clone(),
            Duration::from_millis(200),
            Arc::new(Auditor::new(vec![memory.clone()])),
        );
        (policy, terminator, memory)
    }

    #[test]
    fn test_log_only_records_without_signal() {
        let (policy, terminator, _) = policy(FakeTerminator::with_alive(&[100]));
        let event = policy.evaluate(ProcessRecord::new(100, "cat")).unwrap();

        assert_eq!(event.seq, 1);
        assert_eq!(event.classification, Classification::ViolationUnknown);
        assert!(!event.enforced);
        assert!(terminator.signals.lock().unwrap().is_empty());
        assert_eq!(policy.terminated_count(), 0);
    }

    #[test]
    fn test_allowed_records_nothing() {
        let (policy, _, memory) = policy(FakeTerminator::default());
        assert!(policy.evaluate(ProcessRecord::new(5, "sleep")).is_none());
        assert_eq!(policy.violation_count(), 0);
        assert!(memory.events().is_empty());
    }

    #[test]
    fn test_graceful_termination() {
        let (policy, terminator, _) = policy(FakeTerminator::with_alive(&[200]));
        policy.set_mode(EnforcementMode::Enforce);

        policy.evaluate(ProcessRecord::new(200, "nc")).unwrap();
        assert_eq!(*terminator.signals.lock().unwrap(), vec![(200, Signal::SIGTERM)]);
        assert_eq!(policy.terminated_count(), 1);
    }

    #[test]
    fn test_escalates_to_sigkill() {
        let mut fake = FakeTerminator::with_alive(&[300]);
        fake.stubborn.insert(300);
        let (policy, terminator, memory) = policy(fake);
        policy.set_mode(EnforcementMode::Enforce);

        policy.evaluate(ProcessRecord::new(300, "stubborn")).unwrap();
        assert_eq!(
            *terminator.signals.lock().unwrap(),
            vec![(300, Signal::SIGTERM), (300, Signal::SIGKILL)]
        );
        assert!(!terminator.is_alive(300));
        assert_eq!(policy.terminated_count(), 1);
        assert!(memory
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::Terminated { pid: 300, forced: true, .. })));
    }

    #[test]
    fn test_vanished_process_not_counted() {
        let (policy, _, _) = policy(FakeTerminator::default());
        assert_eq!(policy.terminate(400).unwrap(), Termination::AlreadyGone);
        assert_eq!(policy.terminated_count(), 0);
    }

    #[test]
    fn test_permission_denied_fails_open() {
        let mut fake = FakeTerminator::with_alive(&[1]);
        fake.protected.insert(1);
        let (policy, _, memory) = policy(fake);
        policy.set_mode(EnforcementMode::Enforce);

        assert!(matches!(policy.terminate(1), Err(LockdownError::Permission { pid: 1, .. })));
        policy.evaluate(ProcessRecord::new(1, "init-like")).unwrap();
        assert!(memory
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::TerminationFailed { pid: 1, .. })));
    }

    #[test]
    fn test_batch_shares_one_grace_period() {
        let mut fake = FakeTerminator::with_alive(&[500, 501, 502, 503]);
        fake.stubborn.extend([501, 502]);
        fake.protected.insert(503);
        let (policy, terminator, _) = policy(fake);

        let started = Instant::now();
        let outcomes = policy.terminate_all(&[500, 501, 502, 503, 504]);
        assert!(started.elapsed() < Duration::from_millis(200 * 2 + 150));

        assert_eq!(outcomes[0].as_ref().unwrap(), &Termination::Graceful);
        assert_eq!(outcomes[1].as_ref().unwrap(), &Termination::Forced);
        assert_eq!(outcomes[2].as_ref().unwrap(), &Termination::Forced);
        assert!(matches!(outcomes[3], Err(LockdownError::Permission { pid: 503, .. })));
        assert_eq!(outcomes[4].as_ref().unwrap(), &Termination::AlreadyGone);
        assert_eq!(policy.terminated_count(), 3);

        // Every SIGTERM goes out before the first SIGKILL.
        let signals = terminator.signals.lock().unwrap();
        let first_kill = signals.iter().position(|(_, s)| *s == Signal::SIGKILL).unwrap();
        assert_eq!(first_kill, 5);
        assert_eq!(signals.iter().filter(|(_, s)| *s == Signal::SIGKILL).count(), 2);
    }

    #[test]
    fn test_detect_never_signals() {
        let (policy, terminator, _) = policy(FakeTerminator::with_alive(&[600]));
        policy.set_mode(EnforcementMode::Enforce);

        let event = policy.detect(ProcessRecord::new(600, "nc")).unwrap();
        assert!(event.enforced);
        assert!(terminator.signals.lock().unwrap().is_empty());

        policy.enforce_all(&[event]);
        assert_eq!(*terminator.signals.lock().unwrap(), vec![(600, Signal::SIGTERM)]);
        assert_eq!(policy.terminated_count(), 1);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let (policy, _, _) = policy(FakeTerminator::default());
        for pid in 10..15 {
            policy.evaluate(ProcessRecord::new(pid, "curl"));
        }
        let seqs: Vec<u64> = policy.violations().iter().map(|v| v.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(policy.violation_count(), 5);
    }
}
