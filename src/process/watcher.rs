//! Background process watcher
//!
//! # State machine
//!
//! ```text
//!   Idle ──start()──► BaselinePending ──take_baseline()──► Watching
//!    ▲                      │                                 │
//!    └──────────────────────┴────────────stop()───────────────┘
//! ```
//!
//! Every cycle enumerates the process table and replaces the known-pid set
//! wholesale. Before the baseline, cycles only observe. Once watching,
//! each pid absent from the previous set is inspected and handed to the
//! [`EnforcementPolicy`].
//!
//! Cycles and the baseline capture are serialized, so a process that
//! existed when the baseline was taken can never look new afterwards.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::error::{LockdownError, Result};
use crate::metrics::{KNOWN_PROCESSES, SCAN_DURATION};
use crate::process::enforcement::{EnforcementPolicy, ViolationEvent};
use crate::process::table::{InspectError, ProcessTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    BaselinePending,
    Watching,
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub interval: Duration,
    /// Skip processes whose parent is this process (its own helper commands).
    pub exempt_own_children: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            exempt_own_children: true,
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub seen: usize,
    pub new: usize,
    pub violations: Vec<ViolationEvent>,
    pub gone: usize,
    pub unclassifiable: usize,
}

/// State shared between the handle and the background task.
struct Shared {
    table: Arc<dyn ProcessTable>,
    policy: Arc<EnforcementPolicy>,
    options: WatcherOptions,
    self_pid: u32,
    state: Mutex<WatcherState>,
    known: Mutex<Arc<HashSet<u32>>>,
    baseline: Mutex<Option<Arc<HashSet<u32>>>>,
    /// Held for a whole cycle or baseline capture
    scan_lock: Mutex<()>,
    cycles: AtomicU64,
}

impl Shared {
    fn state(&self) -> WatcherState {
        self.state.lock().map(|s| *s).unwrap_or(WatcherState::Idle)
    }

    fn set_state(&self, state: WatcherState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn known(&self) -> Arc<HashSet<u32>> {
        self.known.lock().map(|k| Arc::clone(&k)).unwrap_or_default()
    }

    fn replace_known(&self, set: HashSet<u32>) {
        KNOWN_PROCESSES.set(set.len() as f64);
        if let Ok(mut known) = self.known.lock() {
            *known = Arc::new(set);
        }
    }

    fn enumerate(&self) -> Result<HashSet<u32>> {
        Ok(self.table.pids()?.into_iter().collect())
    }

    fn scan_once(&self) -> Result<ScanReport> {
        let _guard = self.scan_lock.lock().map_err(|_| {
            LockdownError::InvalidState("watcher scan lock poisoned".into())
        })?;
        let started = Instant::now();

        let current = self.enumerate()?;
        let previous = self.known();
        let mut report = ScanReport {
            seen: current.len(),
            ..ScanReport::default()
        };

        if self.state() == WatcherState::Watching {
            let mut new: Vec<u32> = current
                .iter()
                .copied()
                .filter(|pid| !previous.contains(pid) && *pid != self.self_pid)
                .collect();
            new.sort_unstable();
            report.new = new.len();

            for pid in new {
                match self.table.inspect(pid) {
                    Ok(record) if record.kernel_thread => {}
                    Ok(record)
                        if self.options.exempt_own_children && record.ppid == Some(self.self_pid) => {}
                    Ok(record) => {
                        if let Some(event) = self.policy.detect(record) {
                            report.violations.push(event);
                        }
                    }
                    Err(InspectError::Gone) => {
                        report.gone += 1;
                    }
                    Err(e) => {
                        // Fail-open for this process; the cycle goes on.
                        warn!(pid = pid, error = %e, "cannot inspect new process");
                        self.policy.record_unclassifiable(pid, &e.to_string());
                        report.unclassifiable += 1;
                    }
                }
            }

            // One batch per cycle; its duration does not grow with the count.
            self.policy.enforce_all(&report.violations);
        }

        // A cycle still finishing after stop() must not repopulate the set.
        if self.state() != WatcherState::Idle {
            self.replace_known(current);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
        SCAN_DURATION.observe(started.elapsed().as_secs_f64());
        if report.new > 0 {
            debug!(
                seen = report.seen,
                new = report.new,
                violations = report.violations.len(),
                "scan cycle"
            );
        }
        Ok(report)
    }

    fn capture_baseline(&self) -> Result<usize> {
        let _guard = self.scan_lock.lock().map_err(|_| {
            LockdownError::InvalidState("watcher scan lock poisoned".into())
        })?;
        match self.state() {
            WatcherState::BaselinePending => {}
            WatcherState::Idle => {
                return Err(LockdownError::InvalidState("watcher is not running".into()))
            }
            WatcherState::Watching => {
                return Err(LockdownError::InvalidState("baseline already captured".into()))
            }
        }

        let current = self.enumerate()?;
        let count = current.len();
        let baseline = Arc::new(current.clone());
        self.replace_known(current);
        if let Ok(mut slot) = self.baseline.lock() {
            *slot = Some(baseline);
        }
        self.set_state(WatcherState::Watching);
        Ok(count)
    }
}

pub struct ProcessWatcher {
    shared: Arc<Shared>,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessWatcher {
    pub fn new(table: Arc<dyn ProcessTable>, policy: Arc<EnforcementPolicy>, options: WatcherOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                table,
                policy,
                options,
                self_pid: std::process::id(),
                state: Mutex::new(WatcherState::Idle),
                known: Mutex::new(Arc::new(HashSet::new())),
                baseline: Mutex::new(None),
                scan_lock: Mutex::new(()),
                cycles: AtomicU64::new(0),
            }),
            stop_tx: None,
            handle: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Current known-pid set. The returned set is never mutated.
    pub fn known_pids(&self) -> Arc<HashSet<u32>> {
        self.shared.known()
    }

    pub fn baseline(&self) -> Option<Arc<HashSet<u32>>> {
        self.shared.baseline.lock().ok().and_then(|b| b.clone())
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> &Arc<EnforcementPolicy> {
        &self.shared.policy
    }

    /// Spawn the polling task. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != WatcherState::Idle || self.handle.is_some() {
            return Err(LockdownError::InvalidState("watcher already started".into()));
        }

        self.shared.set_state(WatcherState::BaselinePending);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let interval = shared.options.interval;

        let task = async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            'poll: loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break 'poll;
                        }
                    }
                    _ = ticker.tick() => {
                        let cycle = Arc::clone(&shared);
                        let span = Span::current();
                        let mut scan = tokio::task::spawn_blocking(move || span.in_scope(|| cycle.scan_once()));
                        // Stop is honoured mid-cycle; the cycle finishes on its own thread.
                        loop {
                            tokio::select! {
                                biased;
                                changed = stop_rx.changed() => {
                                    if changed.is_err() || *stop_rx.borrow() {
                                        break 'poll;
                                    }
                                }
                                joined = &mut scan => {
                                    match joined {
                                        Ok(Ok(_)) => {}
                                        Ok(Err(e)) => warn!(error = %e, "scan cycle failed"),
                                        Err(e) => error!(error = %e, "scan cycle panicked"),
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            debug!("watcher loop exited");
        };
        let handle = tokio::spawn(task.instrument(Span::current()));

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        info!(interval = ?interval, "process watcher started");
        Ok(())
    }

    /// Run one cycle now, on the calling thread.
    pub fn scan_once(&self) -> Result<ScanReport> {
        self.shared.scan_once()
    }

    /// Capture the baseline: the anti-preload checkpoint. Exactly once per
    /// start; an error while idle.
    pub async fn take_baseline(&self) -> Result<usize> {
        let shared = Arc::clone(&self.shared);
        let count = tokio::task::spawn_blocking(move || shared.capture_baseline())
            .await
            .map_err(|e| LockdownError::InvalidState(format!("baseline task failed: {}", e)))??;
        info!(processes = count, "baseline captured; new processes are now classified");
        Ok(count)
    }

    /// Signal the loop and join it, aborting after `timeout`. Safe to call
    /// when never started.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }

        let mut result = Ok(());
        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "watcher task ended abnormally"),
                Err(_) => {
                    warn!(timeout = ?timeout, "watcher did not stop in time, aborting");
                    handle.abort();
                    result = Err(LockdownError::InvalidState("watcher stop timed out".into()));
                }
            }
        }

        self.shared.set_state(WatcherState::Idle);
        if let Ok(mut baseline) = self.shared.baseline.lock() {
            *baseline = None;
        }
        self.shared.replace_known(HashSet::new());
        debug!("process watcher stopped");
        result
    }
}
