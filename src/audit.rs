//! Audit trail
//!
//! Security-relevant events (violations, terminations, processes that could
//! not be inspected, lifecycle transitions) are emitted once through an
//! [`Auditor`] and fanned out to every configured [`AuditSink`].
//!
//! ```text
//! EnforcementPolicy ─┐
//! ProcessWatcher ────┼──► Auditor (stamps time + session) ──┬──► TracingAuditSink
//! TunnelSupervisor ──┤                                      ├──► JsonlAuditSink
//! LockdownOrchestrator┘                                     └──► MemoryAuditSink
//! ```
//!
//! Sinks never fail the caller: a sink that cannot write logs a warning.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::network::tunnel::TunnelState;
use crate::orchestrator::LockdownState;
use crate::process::classify::Classification;

/// A security-relevant event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Violation {
        pid: u32,
        name: String,
        path: Option<PathBuf>,
        classification: Classification,
        reason: String,
        enforced: bool,
    },
    Terminated {
        pid: u32,
        name: String,
        forced: bool,
    },
    TerminationFailed {
        pid: u32,
        name: String,
        reason: String,
    },
    /// Fail-open: the process could not be inspected and was left alone.
    Unclassifiable {
        pid: u32,
        reason: String,
    },
    StateChanged {
        from: LockdownState,
        to: LockdownState,
    },
    TunnelTransition {
        interface: String,
        from: TunnelState,
        to: TunnelState,
    },
}

/// An event stamped with time and session.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Writes each record as a structured tracing event.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let session = record.session_id.map(|id| id.to_string()).unwrap_or_default();
        match &record.event {
            AuditEvent::Violation { pid, name, classification, reason, enforced, .. } => {
                tracing::warn!(
                    target: "examlock::audit",
                    session = %session,
                    pid = pid,
                    name = %name,
                    classification = ?classification,
                    enforced = enforced,
                    "violation: {}",
                    reason
                );
            }
            AuditEvent::Terminated { pid, name, forced } => {
                tracing::warn!(target: "examlock::audit", session = %session, pid = pid, name = %name, forced = forced, "process terminated");
            }
            AuditEvent::TerminationFailed { pid, name, reason } => {
                tracing::error!(target: "examlock::audit", session = %session, pid = pid, name = %name, "termination failed: {}", reason);
            }
            AuditEvent::Unclassifiable { pid, reason } => {
                tracing::warn!(target: "examlock::audit", session = %session, pid = pid, "process left running, cannot inspect: {}", reason);
            }
            AuditEvent::StateChanged { from, to } => {
                tracing::info!(target: "examlock::audit", session = %session, from = ?from, to = ?to, "lockdown state changed");
            }
            AuditEvent::TunnelTransition { interface, from, to } => {
                tracing::info!(target: "examlock::audit", session = %session, interface = %interface, from = ?from, to = ?to, "tunnel state changed");
            }
        }
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write audit record");
        }
    }
}

/// Keeps records in memory; used by `examlock` tests and embedders.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.records
            .lock()
            .map(|r| r.iter().map(|rec| rec.event.clone()).collect())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Stamps events and forwards them to every sink.
pub struct Auditor {
    sinks: Vec<Arc<dyn AuditSink>>,
    session_id: RwLock<Option<Uuid>>,
}

impl Auditor {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            sinks,
            session_id: RwLock::new(None),
        }
    }

    /// Auditor that only logs through tracing.
    pub fn tracing_only() -> Self {
        Self::new(vec![Arc::new(TracingAuditSink)])
    }

    pub fn set_session(&self, id: Option<Uuid>) {
        if let Ok(mut session) = self.session_id.write() {
            *session = id;
        }
    }

    pub fn session(&self) -> Option<Uuid> {
        self.session_id.read().ok().and_then(|s| *s)
    }

    pub fn emit(&self, event: AuditEvent) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            session_id: self.session(),
            event,
        };
        for sink in &self.sinks {
            sink.record(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_and_session_stamp() {
        let memory = Arc::new(MemoryAuditSink::new());
        let auditor = Auditor::new(vec![memory.clone(), Arc::new(TracingAuditSink)]);
        let session = Uuid::now_v7();
        auditor.set_session(Some(session));

        auditor.emit(AuditEvent::Unclassifiable {
            pid: 42,
            reason: "permission denied".into(),
        });

        assert_eq!(
            memory.events(),
            vec![AuditEvent::Unclassifiable {
                pid: 42,
                reason: "permission denied".into()
            }]
        );
        assert_eq!(auditor.session(), Some(session));
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let sink = Arc::new(JsonlAuditSink::open(&path).unwrap());
        let auditor = Auditor::new(vec![sink]);

        auditor.emit(AuditEvent::Terminated {
            pid: 7,
            name: "cat".into(),
            forced: false,
        });
        auditor.emit(AuditEvent::Terminated {
            pid: 8,
            name: "nc".into(),
            forced: true,
        });

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "terminated");
        assert_eq!(first["pid"], 7);
        assert_eq!(first["forced"], false);
    }
}
