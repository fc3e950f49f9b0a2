//! examlock - exam lockdown enforcement engine
//!
//! Confines a host for the duration of an exam: all traffic through a
//! WireGuard tunnel, egress only to allowed domains, and only allowlisted
//! programs may start once the session is locked.
//!
//! # Modules
//!
//! - `config` - JSON configuration and validation
//! - `network` - tunnel supervisor, DNS resolution, kill switch, firewall chains
//! - `process` - /proc inspection, allowlist store, classification, enforcement, watcher
//! - `orchestrator` - session lifecycle: start/stop ordering, rollback, status
//! - `audit` - structured audit trail (tracing + optional JSONL file)
//! - `metrics` - Prometheus counters and gauges
//! - `security` - capability pre-flight
//! - `exec` - external command runner (real, recording, namespace-wrapped)
//!
//! # Quick Start
//!
//! ```ignore
//! use examlock::{LockdownConfig, LockdownOrchestrator};
//!
//! let config = LockdownConfig::load("/etc/examlock/config.json".as_ref())?;
//! let mut lockdown = LockdownOrchestrator::builder(config).build()?;
//! lockdown.start().await?;
//! // ... exam runs ...
//! lockdown.stop().await?;
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod network;
pub mod orchestrator;
pub mod process;
pub mod security;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use config::{LockdownConfig, Mode};
pub use error::{LockdownError, Result};
pub use orchestrator::{LockdownOrchestrator, LockdownState, LockdownStatus};
pub use process::{AllowlistStore, EnforcementMode};
