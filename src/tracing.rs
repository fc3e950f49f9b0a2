//! Structured logging setup
//!
//! Logs go to stderr, either human-readable or one JSON object per line.
//! Everything logged while a session runs, the watcher task included, sits
//! inside a `session` span carrying `session_id`, so lines from one exam
//! can be pulled out of a shared journal.
//!
//! ```text
//! examlock ──► tracing ──► EnvFilter ──► fmt layer (pretty | json) ──► stderr
//!                  │
//!                  └──► TracingAuditSink (target = "examlock::audit")
//! ```
//!
//! No exporter is attached: once the kill switch is up, a remote collector
//! would be unreachable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Default filter when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "info,examlock=debug";

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over `filter`. Calling this twice returns an error from
/// the second call instead of panicking.
///
/// # Example
/// ```ignore
/// init_tracing(LogFormat::Json, "info")?;
/// ```
pub fn init_tracing(
    format: LogFormat,
    filter: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    tracing::debug!(format = ?format, "tracing initialized");
    Ok(())
}
