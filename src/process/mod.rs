//! Process allowlist enforcement
//!
//! ```text
//! ProcessTable ──► ProcessWatcher ──new pid──► EnforcementPolicy ──► Terminator
//!   (/proc)         (diff per cycle)            classify + act       (kill(2))
//!                                                   │
//!                                             AllowlistStore
//! ```

pub mod allowlist;
pub mod classify;
pub mod enforcement;
pub mod table;
pub mod watcher;

pub use allowlist::{AllowlistEntry, AllowlistStore};
pub use classify::Classification;
pub use enforcement::{EnforcementMode, EnforcementPolicy, SignalTerminator, Terminator, ViolationEvent};
pub use table::{InspectError, ProcFs, ProcessRecord, ProcessTable};
pub use watcher::{ProcessWatcher, WatcherOptions, WatcherState};
