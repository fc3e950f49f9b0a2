//! Error taxonomy for the lockdown engine
//!
//! Errors fall into two groups:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────────┐
//! │ Session-fatal                │ Absorbed by the component            │
//! ├──────────────────────────────┼──────────────────────────────────────┤
//! │ Config    (before mutation)  │ Resolution  (allow-set degrades)     │
//! │ Tunnel    (never came up)    │ Permission  (fail-open, one process) │
//! │ ExternalTool (rolls back)    │                                      │
//! │ AlreadyActive (guard)        │                                      │
//! └──────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! `Integrity` is neither: it is returned to the caller and never corrected.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LockdownError>;

/// Every failure the lockdown engine can report.
#[derive(Debug, Error)]
pub enum LockdownError {
    /// Malformed or missing required settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// A system-level command returned failure or could not be run.
    #[error("{program} failed ({status}): {stderr}")]
    ExternalTool {
        program: String,
        status: String,
        stderr: String,
    },

    /// A domain could not be resolved.
    #[error("could not resolve {domain}: {reason}")]
    Resolution { domain: String, reason: String },

    /// Insufficient privilege to inspect or signal a process.
    #[error("permission denied for pid {pid}: {reason}")]
    Permission { pid: u32, reason: String },

    /// Stored digest does not match the executable on disk.
    #[error("digest mismatch for {}: expected {expected}, found {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The secure tunnel could not be established.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Another lockdown session already owns the firewall and route.
    #[error("a lockdown session is already active")]
    AlreadyActive,

    /// An operation was called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LockdownError {
    /// Build an `ExternalTool` error from a command and its outcome.
    pub fn external(program: impl Into<String>, status: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::ExternalTool {
            program: program.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether this error must abort the whole session rather than a single step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Tunnel(_) | Self::AlreadyActive | Self::Integrity { .. }
        )
    }

    /// Whether the owning component should log and continue.
    pub fn is_absorbable(&self) -> bool {
        matches!(self, Self::Resolution { .. } | Self::Permission { .. })
    }
}
