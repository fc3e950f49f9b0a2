//! examlock command line
//!
//! ```text
//! examlock run        lock down until SIGINT/SIGTERM, then restore
//! examlock check      pre-flight only, nothing is changed
//! examlock rules      print the firewall commands an activation would run
//! examlock restore    reinstate rules saved by a session that crashed
//! examlock allowlist  manage the program allowlist
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use examlock::config::LogFormat;
use examlock::network::SystemLookup;
use examlock::orchestrator::dry_run_rules;
use examlock::security::describe_current_caps;
use examlock::tracing::{init_tracing, DEFAULT_FILTER};
use examlock::{AllowlistStore, LockdownConfig, LockdownOrchestrator};

/// How often the tunnel is probed while a session runs.
const TUNNEL_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "examlock", version, about = "Exam lockdown enforcement engine")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "EXAMLOCK_CONFIG", default_value = "/etc/examlock/config.json")]
    config: PathBuf,

    /// Override the configured log format
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a lockdown session and hold it until interrupted
    Run {
        /// Write the Prometheus exposition here on every tunnel check and at exit
        #[arg(long)]
        metrics: Option<PathBuf>,
        /// Stay in log-only mode after the baseline
        #[arg(long)]
        log_only: bool,
    },
    /// Validate configuration, allowlist and privileges
    Check,
    /// Resolve the allowed domains and print the firewall commands
    Rules,
    /// Reinstate firewall rules saved before a crashed session
    Restore,
    /// Manage the program allowlist
    Allowlist {
        /// Allowlist file (defaults to process.allowlist_path from the config)
        #[arg(long)]
        file: Option<PathBuf>,
        #[command(subcommand)]
        action: AllowlistAction,
    },
}

#[derive(Subcommand)]
enum AllowlistAction {
    /// Allow a program by name, optionally pinning its path
    Add {
        name: String,
        #[arg(long)]
        path: Option<PathBuf>,
        /// Record the SHA-256 of the file at --path
        #[arg(long, requires = "path")]
        digest: bool,
    },
    /// Remove a program and the paths recorded for it
    Remove { name: String },
    /// Print the allowlist
    List,
    /// Check every recorded digest
    Verify,
}

fn parse_log_format(raw: &str) -> std::result::Result<LogFormat, String> {
    match raw {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {:?} (pretty|json)", other)),
    }
}

fn setup_logging(format: LogFormat, filter: &str) -> Result<()> {
    init_tracing(format, filter).map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

fn load_config(path: &Path) -> Result<LockdownConfig> {
    LockdownConfig::load(path).with_context(|| format!("failed to load configuration {}", path.display()))
}

/// Load the configuration and start logging the way it asks.
fn session_config(path: &Path, log_format: Option<LogFormat>) -> Result<LockdownConfig> {
    let config = load_config(path)?;
    setup_logging(log_format.unwrap_or(config.logging.format), &config.logging.filter)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { metrics, log_only } => {
            run(session_config(&cli.config, cli.log_format)?, metrics, log_only).await
        }
        Command::Check => check(session_config(&cli.config, cli.log_format)?),
        Command::Rules => rules(&session_config(&cli.config, cli.log_format)?),
        Command::Restore => restore(session_config(&cli.config, cli.log_format)?),
        Command::Allowlist { file, action } => {
            setup_logging(cli.log_format.unwrap_or_default(), DEFAULT_FILTER)?;
            let path = match file {
                Some(path) => path,
                None => load_config(&cli.config)?.process.allowlist_path,
            };
            allowlist(&path, action)
        }
    }
}

async fn run(mut config: LockdownConfig, metrics: Option<PathBuf>, log_only: bool) -> Result<()> {
    if log_only {
        config.process.enforce = false;
    }

    let mut lockdown = LockdownOrchestrator::builder(config).build()?;
    lockdown.start().await.context("lockdown failed to start")?;
    println!("🔒 Lockdown active (Ctrl+C to end the session)");

    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let mut ticker = tokio::time::interval(TUNNEL_CHECK_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = ticker.tick() => {
                if !lockdown.check_tunnel() {
                    warn!("tunnel is down; traffic held by the kill switch");
                }
                if let Some(path) = &metrics {
                    write_metrics(path);
                }
            }
        }
    }

    let stopped = lockdown.stop().await;
    if let Some(path) = &metrics {
        write_metrics(path);
    }
    println!("{}", serde_json::to_string_pretty(&lockdown.status())?);
    stopped.context("lockdown did not stop cleanly")?;
    println!("🔓 Lockdown ended");
    Ok(())
}

fn write_metrics(path: &Path) {
    if let Err(e) = std::fs::write(path, examlock::metrics::render()) {
        warn!(path = %path.display(), error = %e, "could not write metrics");
    }
}

fn check(config: LockdownConfig) -> Result<()> {
    println!("Mode:        {:?}", config.mode);
    println!("Tunnel:      {} ({})", config.vpn.interface, config.vpn.config_path.display());
    println!("Kill switch: {}", if config.vpn.kill_switch_enabled { "on" } else { "off" });
    println!("Domains:     {}", config.network.allowed_domains.join(", "));
    println!("Capabilities:\n{}", describe_current_caps());

    let lockdown = LockdownOrchestrator::builder(config).build()?;
    let allowlist = lockdown.preflight().context("pre-flight failed")?;
    println!(
        "✅ Pre-flight passed ({} programs, {} paths, {} digests)",
        allowlist.names().len(),
        allowlist.paths().len(),
        allowlist.checksums().len()
    );
    Ok(())
}

fn rules(config: &LockdownConfig) -> Result<()> {
    for line in dry_run_rules(config, Arc::new(SystemLookup))? {
        println!("{}", line);
    }
    Ok(())
}

fn restore(config: LockdownConfig) -> Result<()> {
    let mut lockdown = LockdownOrchestrator::builder(config).build()?;
    lockdown.recover_firewall().context("firewall restore failed")?;
    println!("✅ Firewall state restored");
    Ok(())
}

fn allowlist(path: &Path, action: AllowlistAction) -> Result<()> {
    match action {
        AllowlistAction::Add { name, path: exe, digest } => {
            let mut store = AllowlistStore::load_or_default(path)?;
            let entry = store.add_entry(&name, exe.as_deref(), digest)?;
            store.save(path)?;
            println!("{}", serde_json::to_string(&entry)?);
        }
        AllowlistAction::Remove { name } => {
            let mut store = AllowlistStore::load(path)?;
            if !store.remove_entry(&name) {
                bail!("{} is not in the allowlist", name);
            }
            store.save(path)?;
            println!("removed {}", name);
        }
        AllowlistAction::List => {
            let store = AllowlistStore::load(path)?;
            for entry in store.entries() {
                match (&entry.path, &entry.digest) {
                    (Some(p), Some(d)) => println!("{}\t{}\tsha256:{}", entry.name, p.display(), d),
                    (Some(p), None) => println!("{}\t{}", entry.name, p.display()),
                    _ => println!("{}", entry.name),
                }
            }
        }
        AllowlistAction::Verify => {
            let store = AllowlistStore::load(path)?;
            store.verify_digests()?;
            println!("✅ {} digests verified", store.checksums().len());
        }
    }
    Ok(())
}
