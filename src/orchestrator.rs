//! Lockdown orchestration
//!
//! # Start sequence
//!
//! ```text
//! preflight ─► guard ─► 1. tunnel up + default route
//!                       2. kill switch + allowlist chains
//!                       3. watcher started (observing)
//!                       4. baseline captured    ◄── anti-preload checkpoint
//!                       5. enforce mode
//!
//!   any step fails ──► best-effort teardown of everything ─► error returned
//! ```
//!
//! # Stop sequence
//!
//! Log-only, watcher joined, firewall removed, tunnel down. Every step runs
//! even when an earlier one fails; the errors are collected.
//!
//! Firewall chains and the default route are host-wide, so only one session
//! may be active per process (static flag) and per host (`flock` on
//! `runtime.lock_path`).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink, Auditor, JsonlAuditSink, TracingAuditSink};
use crate::config::LockdownConfig;
use crate::error::{LockdownError, Result};
use crate::exec::{CommandRunner, NetExec, RecordingRunner, SystemRunner};
use crate::metrics::LOCKDOWN_STATE;
use crate::network::firewall::{FirewallOptions, FirewallRuleEngine};
use crate::network::resolver::{DomainResolver, HostLookup, ResolvedAddrs, SystemLookup};
use crate::network::tunnel::{TunnelState, TunnelSupervisor};
use crate::process::allowlist::AllowlistStore;
use crate::process::enforcement::{
    EnforcementMode, EnforcementPolicy, SignalTerminator, Terminator, ViolationEvent,
};
use crate::process::table::{ProcFs, ProcessTable};
use crate::process::watcher::{ProcessWatcher, WatcherOptions};
use crate::security::PrivilegeCheck;

/// Delay between tunnel bring-up attempts.
const TUNNEL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Session-wide lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockdownState {
    Inactive,
    NetworkActive,
    ProcessActive,
    FullyLocked,
    Stopping,
}

impl LockdownState {
    fn gauge_value(&self) -> f64 {
        match self {
            LockdownState::Inactive => 0.0,
            LockdownState::NetworkActive => 1.0,
            LockdownState::ProcessActive => 2.0,
            LockdownState::FullyLocked => 3.0,
            LockdownState::Stopping => 4.0,
        }
    }
}

/// Best-known truth about the session.
#[derive(Debug, Clone, Serialize)]
pub struct LockdownStatus {
    pub state: LockdownState,
    pub session_id: Option<Uuid>,
    pub tunnel_up: bool,
    pub tunnel_state: TunnelState,
    pub firewall_active: bool,
    pub watcher_active: bool,
    pub enforcement_mode: EnforcementMode,
    pub violation_count: u64,
    pub terminated_count: u64,
    pub known_processes: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// SessionGuard
// ═══════════════════════════════════════════════════════════════════════════
// Held for the life of a session. Dropping it releases both the in-process
// flag and the host-wide flock. The lock file itself stays on disk so every
// contender locks the same inode.
// ═══════════════════════════════════════════════════════════════════════════

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

pub struct SessionGuard {
    lock_file: Option<File>,
    lock_path: Option<PathBuf>,
}

impl SessionGuard {
    pub fn acquire(lock_path: Option<&Path>) -> Result<Self> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LockdownError::AlreadyActive);
        }

        let Some(path) = lock_path else {
            return Ok(Self {
                lock_file: None,
                lock_path: None,
            });
        };

        match Self::lock(path) {
            Ok(file) => Ok(Self {
                lock_file: Some(file),
                lock_path: Some(path.to_path_buf()),
            }),
            Err(e) => {
                SESSION_ACTIVE.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn lock(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => return Err(LockdownError::AlreadyActive),
            Err(errno) => return Err(LockdownError::Io(errno.into())),
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "session lock acquired");
        Ok(file)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Closing the file releases the flock. Never unlinked.
        if self.lock_file.take().is_some() {
            if let Some(path) = &self.lock_path {
                debug!(path = %path.display(), "session lock released");
            }
        }
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════

pub struct OrchestratorBuilder {
    config: LockdownConfig,
    runner: Option<Arc<dyn CommandRunner>>,
    table: Option<Arc<dyn ProcessTable>>,
    terminator: Option<Arc<dyn Terminator>>,
    lookup: Option<Arc<dyn HostLookup>>,
    sinks: Vec<Arc<dyn AuditSink>>,
    check_privileges: bool,
    exempt_own_children: bool,
}

impl OrchestratorBuilder {
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn process_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn lookup(mut self, lookup: Arc<dyn HostLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Skip the capability pre-flight (production mode only checks it).
    pub fn skip_privilege_check(mut self) -> Self {
        self.check_privileges = false;
        self
    }

    /// Whether children of this process are exempt from classification.
    pub fn exempt_own_children(mut self, exempt: bool) -> Self {
        self.exempt_own_children = exempt;
        self
    }

    pub fn build(self) -> Result<LockdownOrchestrator> {
        let config = self.config;
        config.validate()?;

        let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
        if let Some(path) = &config.runtime.audit_log {
            sinks.push(Arc::new(JsonlAuditSink::open(path)?));
        }
        sinks.extend(self.sinks);
        let auditor = Arc::new(Auditor::new(sinks));

        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(SystemRunner::new(config.command_timeout())));
        let exec = NetExec::new(runner, config.namespace().map(String::from));

        let tunnel = TunnelSupervisor::new(
            exec.clone(),
            &config.vpn.interface,
            config.vpn.config_path.clone(),
            Arc::clone(&auditor),
        );
        let firewall = FirewallRuleEngine::new(exec, firewall_options(&config, true));

        Ok(LockdownOrchestrator {
            table: self.table.unwrap_or_else(|| Arc::new(ProcFs::new())),
            terminator: self.terminator.unwrap_or_else(|| Arc::new(SignalTerminator)),
            lookup: self.lookup.unwrap_or_else(|| Arc::new(SystemLookup)),
            auditor,
            check_privileges: self.check_privileges,
            exempt_own_children: self.exempt_own_children,
            tunnel,
            firewall,
            watcher: None,
            policy: None,
            state: LockdownState::Inactive,
            guard: None,
            session_id: None,
            span: Span::none(),
            config,
        })
    }
}

fn firewall_options(config: &LockdownConfig, persist: bool) -> FirewallOptions {
    FirewallOptions {
        tunnel_interface: config.vpn.interface.clone(),
        kill_switch: config.vpn.kill_switch_enabled,
        endpoint: config.vpn.endpoint,
        backup_dir: persist.then(|| config.runtime.backup_dir.clone()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LockdownOrchestrator
// ═══════════════════════════════════════════════════════════════════════════

pub struct LockdownOrchestrator {
    config: LockdownConfig,
    table: Arc<dyn ProcessTable>,
    terminator: Arc<dyn Terminator>,
    lookup: Arc<dyn HostLookup>,
    auditor: Arc<Auditor>,
    check_privileges: bool,
    exempt_own_children: bool,
    tunnel: TunnelSupervisor,
    firewall: FirewallRuleEngine,
    watcher: Option<ProcessWatcher>,
    /// Kept after stop so the final counts stay readable
    policy: Option<Arc<EnforcementPolicy>>,
    state: LockdownState,
    guard: Option<SessionGuard>,
    session_id: Option<Uuid>,
    /// Carries `session_id` on every line logged while the session runs
    span: Span,
}

impl LockdownOrchestrator {
    pub fn builder(config: LockdownConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            runner: None,
            table: None,
            terminator: None,
            lookup: None,
            sinks: Vec::new(),
            check_privileges: true,
            exempt_own_children: true,
        }
    }

    pub fn config(&self) -> &LockdownConfig {
        &self.config
    }

    pub fn state(&self) -> LockdownState {
        self.state
    }

    fn set_state(&mut self, to: LockdownState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        LOCKDOWN_STATE.set(to.gauge_value());
        self.auditor.emit(AuditEvent::StateChanged { from, to });
    }

    /// Everything that can be checked without changing the system.
    ///
    /// Returns the allowlist the session will enforce.
    pub fn preflight(&self) -> Result<Arc<AllowlistStore>> {
        self.config.validate()?;

        let path = &self.config.process.allowlist_path;
        let allowlist = AllowlistStore::load(path).map_err(|e| {
            LockdownError::Config(format!("cannot load allowlist {}: {}", path.display(), e))
        })?;
        if allowlist.is_empty() {
            return Err(LockdownError::Config(format!(
                "allowlist {} is empty",
                path.display()
            )));
        }
        allowlist.verify_digests()?;
        self.firewall.check_backup_clean()?;

        if self.check_privileges && !self.config.mode.is_isolated() {
            PrivilegeCheck::for_lockdown().verify()?;
        }

        info!(
            processes = allowlist.names().len(),
            paths = allowlist.paths().len(),
            domains = self.config.network.allowed_domains.len(),
            "pre-flight checks passed"
        );
        Ok(Arc::new(allowlist))
    }

    /// Run the start sequence. On failure everything already done is torn
    /// down and the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != LockdownState::Inactive || self.guard.is_some() {
            return Err(LockdownError::AlreadyActive);
        }

        let allowlist = self.preflight()?;
        self.guard = Some(SessionGuard::acquire(self.config.runtime.lock_path.as_deref())?);

        let session_id = Uuid::now_v7();
        self.session_id = Some(session_id);
        self.auditor.set_session(Some(session_id));
        let span = info_span!("session", session_id = %session_id);
        self.span = span.clone();

        async move {
            info!(mode = ?self.config.mode, "starting lockdown");
            match self.start_sequence(allowlist).await {
                Ok(()) => {
                    info!("lockdown fully active");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "lockdown start failed, rolling back");
                    self.set_state(LockdownState::Stopping);
                    for failure in self.teardown().await {
                        error!(error = %failure, "rollback step failed");
                    }
                    self.set_state(LockdownState::Inactive);
                    self.guard = None;
                    self.span = Span::none();
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn start_sequence(&mut self, allowlist: Arc<AllowlistStore>) -> Result<()> {
        // 1. Tunnel
        self.bring_up_tunnel().await?;
        let gateway = self.config.vpn.vpn_gateway.clone();
        let interface = self.config.vpn.interface.clone();
        self.tunnel.configure_default_route(&gateway, &interface)?;

        // 2. Kill switch + allowlist chains
        let addrs = self.resolve_domains().await?;
        self.firewall.activate(&addrs)?;
        self.set_state(LockdownState::NetworkActive);

        // 3. Watcher, observing only
        let policy = Arc::new(EnforcementPolicy::new(
            allowlist,
            Arc::clone(&self.terminator),
            self.config.grace_period(),
            Arc::clone(&self.auditor),
        ));
        self.policy = Some(Arc::clone(&policy));
        let options = WatcherOptions {
            interval: self.config.poll_interval(),
            exempt_own_children: self.exempt_own_children,
        };
        let mut watcher = ProcessWatcher::new(Arc::clone(&self.table), Arc::clone(&policy), options);
        watcher.start()?;
        self.watcher = Some(watcher);
        self.set_state(LockdownState::ProcessActive);

        // 4. Anti-preload checkpoint
        if let Some(watcher) = &self.watcher {
            watcher.take_baseline().await?;
        }

        // 5. Enforcement
        if self.config.process.enforce {
            policy.set_mode(EnforcementMode::Enforce);
        } else {
            warn!("process enforcement disabled; violations are logged only");
        }
        self.set_state(LockdownState::FullyLocked);
        Ok(())
    }

    async fn bring_up_tunnel(&mut self) -> Result<()> {
        let attempts = self.config.runtime.tunnel_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.tunnel.up() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt = attempt, attempts = attempts, error = %e, "tunnel bring-up failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        if let Err(e) = self.tunnel.down() {
                            debug!(error = %e, "cleanup after failed bring-up");
                        }
                        tokio::time::sleep(TUNNEL_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LockdownError::Tunnel("tunnel did not come up".into())))
    }

    async fn resolve_domains(&self) -> Result<ResolvedAddrs> {
        let lookup = Arc::clone(&self.lookup);
        let domains = self.config.network.allowed_domains.clone();
        tokio::task::spawn_blocking(move || DomainResolver::new(lookup).resolve(&domains))
            .await
            .map_err(|e| LockdownError::InvalidState(format!("resolver task failed: {}", e)))
    }

    /// Reverse of start, best-effort. Safe after a partial start and when
    /// nothing is running.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == LockdownState::Inactive && self.guard.is_none() {
            debug!("stop requested with no active session");
            return Ok(());
        }

        let span = std::mem::replace(&mut self.span, Span::none());
        async move {
            info!("stopping lockdown");
            self.set_state(LockdownState::Stopping);
            let mut failures = self.teardown().await;
            self.set_state(LockdownState::Inactive);
            self.guard = None;
            self.auditor.set_session(None);

            if failures.is_empty() {
                info!("lockdown stopped");
                return Ok(());
            }
            for failure in &failures {
                error!(error = %failure, "stop step failed");
            }
            Err(failures.remove(0))
        }
        .instrument(span)
        .await
    }

    async fn teardown(&mut self) -> Vec<LockdownError> {
        let mut failures = Vec::new();

        if let Some(policy) = &self.policy {
            policy.set_mode(EnforcementMode::LogOnly);
        }

        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.stop(self.config.stop_timeout()).await {
                failures.push(e);
            }
        }

        if let Err(e) = self.firewall.deactivate() {
            failures.push(e);
        }

        if let Err(e) = self.tunnel.down() {
            failures.push(e);
        }

        failures
    }

    /// Liveness probe for the tunnel; records a transition on change. The
    /// kill switch keeps traffic closed while it is down.
    pub fn check_tunnel(&mut self) -> bool {
        let _session = self.span.clone().entered();
        match self.tunnel.state() {
            TunnelState::Up | TunnelState::Failed => self.tunnel.refresh(),
            _ => false,
        }
    }

    pub fn status(&self) -> LockdownStatus {
        let (mode, violations, terminated) = match &self.policy {
            Some(policy) => (policy.mode(), policy.violation_count(), policy.terminated_count()),
            None => (EnforcementMode::LogOnly, 0, 0),
        };
        LockdownStatus {
            state: self.state,
            session_id: self.session_id,
            tunnel_up: self.tunnel.state() == TunnelState::Up,
            tunnel_state: self.tunnel.state(),
            firewall_active: self.firewall.is_active(),
            watcher_active: self.watcher.as_ref().map(|w| w.is_running()).unwrap_or(false),
            enforcement_mode: mode,
            violation_count: violations,
            terminated_count: terminated,
            known_processes: self.watcher.as_ref().map(|w| w.known_pids().len()).unwrap_or(0),
        }
    }

    pub fn violations(&self) -> Vec<ViolationEvent> {
        self.policy.as_ref().map(|p| p.violations()).unwrap_or_default()
    }

    /// Restore firewall state left behind by a crashed session.
    pub fn recover_firewall(&mut self) -> Result<()> {
        if self.state != LockdownState::Inactive {
            return Err(LockdownError::AlreadyActive);
        }
        let _guard = SessionGuard::acquire(self.config.runtime.lock_path.as_deref())?;
        self.firewall.restore()
    }
}

/// Firewall commands an activation would issue, without executing any.
pub fn dry_run_rules(config: &LockdownConfig, lookup: Arc<dyn HostLookup>) -> Result<Vec<String>> {
    config.validate()?;
    let runner = Arc::new(RecordingRunner::new());
    let exec = NetExec::new(runner.clone(), config.namespace().map(String::from));
    let mut engine = FirewallRuleEngine::new(exec, firewall_options(config, false));

    let addrs = DomainResolver::new(lookup).resolve(&config.network.allowed_domains);
    engine.activate(&addrs)?;
    Ok(runner.lines())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::network::resolver::tests::StaticLookup;
    use crate::process::enforcement::tests::FakeTerminator;
    use crate::process::table::{InspectError, ProcessRecord};
    use lazy_static::lazy_static;
    use std::collections::HashMap;
    use std::net::IpAddr;

    lazy_static! {
        /// Sessions are process-wide; tests that start one take turns.
        static ref SESSION_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    }

    struct EmptyTable;

    impl ProcessTable for EmptyTable {
        fn pids(&self) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }

        fn inspect(&self, _pid: u32) -> std::result::Result<ProcessRecord, InspectError> {
            Err(InspectError::Gone)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: LockdownConfig,
        runner: Arc<RecordingRunner>,
        memory: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let allowlist_path = dir.path().join("allowlist.json");
        let mut store = AllowlistStore::new();
        store.add_entry("sleep", None, false).unwrap();
        store.save(&allowlist_path).unwrap();

        let raw = format!(
            r#"{{
                "mode": "testing",
                "network": {{ "allowed_domains": ["exam.example", "*.exam.example"] }},
                "vpn": {{ "interface": "wg0", "config_path": "/etc/wireguard/exam.conf" }},
                "process": {{ "allowlist_path": "{}", "poll_interval_ms": 50 }},
                "runtime": {{ "lock_path": null, "tunnel_retries": 1, "stop_timeout_secs": 2 }}
            }}"#,
            allowlist_path.display()
        );
        let config = LockdownConfig::from_json(&raw).unwrap();
        Fixture {
            _dir: dir,
            config,
            runner: Arc::new(RecordingRunner::new()),
            memory: Arc::new(MemoryAuditSink::new()),
        }
    }

    fn lookup() -> Arc<dyn HostLookup> {
        let mut map: HashMap<String, Vec<IpAddr>> = HashMap::new();
        map.insert("exam.example".into(), vec!["203.0.113.10".parse().unwrap()]);
        Arc::new(StaticLookup(map))
    }

    fn build(f: &Fixture) -> LockdownOrchestrator {
        LockdownOrchestrator::builder(f.config.clone())
            .runner(f.runner.clone())
            .process_table(Arc::new(EmptyTable))
            .terminator(Arc::new(FakeTerminator::default()))
            .lookup(lookup())
            .audit_sink(f.memory.clone())
            .build()
            .unwrap()
    }

    fn position(lines: &[String], needle: &str) -> usize {
        lines
            .iter()
            .position(|l| l.contains(needle))
            .unwrap_or_else(|| panic!("no command containing {:?}", needle))
    }

    #[tokio::test]
    async fn test_start_order_and_status() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        let mut orchestrator = build(&f);

        orchestrator.start().await.unwrap();
        let lines = f.runner.lines();
        let tunnel = position(&lines, "wg-quick up");
        let route = position(&lines, "route add default via 10.8.0.1 dev wg0");
        let kill_switch = position(&lines, "iptables -P OUTPUT DROP");
        let chain = position(&lines, "-d 203.0.113.10 -j ACCEPT");
        assert!(tunnel < route && route < kill_switch && kill_switch < chain);

        let status = orchestrator.status();
        assert_eq!(status.state, LockdownState::FullyLocked);
        assert!(status.tunnel_up && status.firewall_active && status.watcher_active);
        assert_eq!(status.enforcement_mode, EnforcementMode::Enforce);
        assert!(status.session_id.is_some());

        orchestrator.stop().await.unwrap();
        let status = orchestrator.status();
        assert_eq!(status.state, LockdownState::Inactive);
        assert!(!status.tunnel_up && !status.firewall_active && !status.watcher_active);
        assert_eq!(status.enforcement_mode, EnforcementMode::LogOnly);
    }

    #[tokio::test]
    async fn test_firewall_failure_rolls_back() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        f.runner.fail_on("-d 203.0.113.10");
        let mut orchestrator = build(&f);

        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, LockdownError::ExternalTool { .. }));

        let lines = f.runner.lines();
        assert!(position(&lines, "wg-quick down") > position(&lines, "wg-quick up"));
        let status = orchestrator.status();
        assert_eq!(status.state, LockdownState::Inactive);
        assert!(!status.tunnel_up && !status.firewall_active && !status.watcher_active);

        // Guard was released
        f.runner.clear_failures();
        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_retries_then_fails() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        f.runner.fail_on("wg-quick up");
        let mut orchestrator = build(&f);

        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, LockdownError::Tunnel(_)));

        let lines = f.runner.lines();
        assert_eq!(lines.iter().filter(|l| l.contains("wg-quick up")).count(), 2);
        assert!(!lines.iter().any(|l| l.contains("iptables -A")));
        assert_eq!(orchestrator.state(), LockdownState::Inactive);
    }

    #[tokio::test]
    async fn test_second_session_rejected() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        let mut first = build(&f);
        let mut second = build(&f);

        first.start().await.unwrap();
        assert!(matches!(second.start().await, Err(LockdownError::AlreadyActive)));
        assert!(matches!(first.start().await, Err(LockdownError::AlreadyActive)));

        first.stop().await.unwrap();
        second.start().await.unwrap();
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        let mut orchestrator = build(&f);

        orchestrator.stop().await.unwrap();
        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
        f.runner.clear();
        orchestrator.stop().await.unwrap();
        assert!(f.runner.lines().is_empty());
    }

    #[tokio::test]
    async fn test_empty_allowlist_fails_before_any_command() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        AllowlistStore::new().save(&f.config.process.allowlist_path).unwrap();
        let mut orchestrator = build(&f);

        assert!(matches!(orchestrator.start().await, Err(LockdownError::Config(_))));
        assert!(f.runner.lines().is_empty());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_log_lines_carry_session_span() {
        let _serial = SESSION_LOCK.lock().await;
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let f = fixture();
        let mut orchestrator = build(&f);
        orchestrator.start().await.unwrap();
        let session_id = orchestrator.status().session_id.unwrap().to_string();
        orchestrator.stop().await.unwrap();

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        for message in ["starting lockdown", "firewall activated", "stopping lockdown", "lockdown stopped"] {
            let line = text
                .lines()
                .find(|l| l.contains(message))
                .unwrap_or_else(|| panic!("no log line {:?}", message));
            assert!(line.contains("\"name\":\"session\""), "{}", line);
            assert!(line.contains(&session_id), "{}", line);
        }
    }

    #[tokio::test]
    async fn test_state_changes_audited() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        let mut orchestrator = build(&f);
        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();

        let states: Vec<LockdownState> = f
            .memory
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                LockdownState::NetworkActive,
                LockdownState::ProcessActive,
                LockdownState::FullyLocked,
                LockdownState::Stopping,
                LockdownState::Inactive,
            ]
        );
    }

    #[tokio::test]
    async fn test_tunnel_loss_detected() {
        let _serial = SESSION_LOCK.lock().await;
        let f = fixture();
        let mut orchestrator = build(&f);
        orchestrator.start().await.unwrap();

        assert!(orchestrator.check_tunnel());
        f.runner.fail_on("wg show");
        assert!(!orchestrator.check_tunnel());
        let status = orchestrator.status();
        assert!(!status.tunnel_up);
        assert_eq!(status.state, LockdownState::FullyLocked);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_file_kept_and_reusable() {
        let _serial = SESSION_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("examlock.lock");

        let guard = SessionGuard::acquire(Some(&path)).unwrap();
        assert!(matches!(SessionGuard::acquire(Some(&path)), Err(LockdownError::AlreadyActive)));

        // A second handle on the same inode is refused while the guard lives.
        let other = File::open(&path).unwrap();
        assert_eq!(
            flock(other.as_raw_fd(), FlockArg::LockExclusiveNonblock),
            Err(Errno::EWOULDBLOCK)
        );

        drop(guard);
        assert!(path.exists());
        assert!(flock(other.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_ok());
        drop(other);

        let again = SessionGuard::acquire(Some(&path)).unwrap();
        let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
        drop(again);
    }

    #[test]
    fn test_dry_run_lists_rules() {
        let f = fixture();
        let lines = dry_run_rules(&f.config, lookup()).unwrap();
        assert!(lines.iter().any(|l| l.ends_with("iptables -A EXAM_FILTER -d 203.0.113.10 -j ACCEPT")));
        assert!(!lines.iter().any(|l| l.contains("EXAM_FILTER_V6")));
    }
}
