//! Lockdown configuration
//!
//! The on-disk format is JSON and follows the layout of the exam system's
//! `system_config.json`:
//!
//! ```text
//! {
//!   "mode": "production",
//!   "network": { "allowed_domains": ["codeforces.com", "*.codeforces.com"] },
//!   "vpn":     { "interface": "wg0", "config_path": "/etc/wireguard/exam.conf" },
//!   "process": { "allowlist_path": "/etc/examlock/allowlist.json" }
//! }
//! ```
//!
//! Every other field has a default.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LockdownError, Result};

/// Where the lockdown is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Everything runs inside an isolated network namespace.
    Testing,
    /// Rules and routes are applied to the host itself.
    Production,
}

impl Mode {
    pub fn is_isolated(&self) -> bool {
        matches!(self, Mode::Testing)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Exact (`codeforces.com`) or wildcard (`*.codeforces.com`) patterns.
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Tunnel interface name (e.g. `wg0`)
    pub interface: String,
    /// wg-quick configuration file
    pub config_path: PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_gateway")]
    pub vpn_gateway: String,
    #[serde(default = "default_true")]
    pub kill_switch_enabled: bool,
    /// Tunnel peer; allowed through the kill switch so the tunnel transport can flow.
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub allowlist_path: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// false keeps the session in log-only mode after the baseline
    #[serde(default = "default_true")]
    pub enforce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_tunnel_retries")]
    pub tunnel_retries: u32,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_lock_path")]
    pub lock_path: Option<PathBuf>,
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            tunnel_retries: default_tunnel_retries(),
            backup_dir: default_backup_dir(),
            lock_path: default_lock_path(),
            audit_log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

/// Top-level configuration consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockdownConfig {
    pub mode: Mode,
    pub network: NetworkConfig,
    pub vpn: VpnConfig,
    pub process: ProcessConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_namespace() -> String {
    "exam_ns".to_string()
}

fn default_gateway() -> String {
    "10.8.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_stop_timeout_secs() -> u64 {
    15
}

fn default_tunnel_retries() -> u32 {
    2
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/examlock")
}

fn default_lock_path() -> Option<PathBuf> {
    Some(PathBuf::from("/run/examlock.lock"))
}

fn default_log_filter() -> String {
    "info,examlock=debug".to_string()
}

impl LockdownConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LockdownError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parse configuration text. Anything before the first `{` (a BOM, a
    /// stray comment line) is ignored.
    pub fn from_json(raw: &str) -> Result<Self> {
        let start = raw
            .find('{')
            .ok_or_else(|| LockdownError::Config("configuration does not contain a JSON object".into()))?;
        let config: Self = serde_json::from_str(&raw[start..])
            .map_err(|e| LockdownError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the session unsafe or unstartable.
    pub fn validate(&self) -> Result<()> {
        if self.network.allowed_domains.iter().all(|d| d.trim().is_empty()) {
            return Err(LockdownError::Config("no allowed domains configured".into()));
        }
        if self.vpn.interface.trim().is_empty() {
            return Err(LockdownError::Config("vpn.interface must not be empty".into()));
        }
        if self.vpn.config_path.as_os_str().is_empty() {
            return Err(LockdownError::Config("vpn.config_path must not be empty".into()));
        }
        if self.vpn.vpn_gateway.parse::<IpAddr>().is_err() {
            return Err(LockdownError::Config(format!(
                "vpn.vpn_gateway is not an IP address: {}",
                self.vpn.vpn_gateway
            )));
        }
        if self.vpn.namespace.is_empty()
            || self.vpn.namespace.contains(|c: char| c.is_whitespace() || c == '/')
        {
            return Err(LockdownError::Config(format!(
                "invalid namespace name: {:?}",
                self.vpn.namespace
            )));
        }
        if self.process.poll_interval_ms == 0 {
            return Err(LockdownError::Config("process.poll_interval_ms must be > 0".into()));
        }
        if self.runtime.command_timeout_secs == 0 {
            return Err(LockdownError::Config("runtime.command_timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Network namespace to wrap commands in, if running isolated.
    pub fn namespace(&self) -> Option<&str> {
        self.mode.is_isolated().then_some(self.vpn.namespace.as_str())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.process.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.process.grace_period_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.command_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "mode": "testing",
        "network": { "allowed_domains": ["codeforces.com", "*.codeforces.com"] },
        "vpn": { "interface": "wg0", "config_path": "/etc/wireguard/exam.conf" },
        "process": { "allowlist_path": "/tmp/allowlist.json" }
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = LockdownConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.mode, Mode::Testing);
        assert_eq!(config.vpn.namespace, "exam_ns");
        assert_eq!(config.vpn.vpn_gateway, "10.8.0.1");
        assert!(config.vpn.kill_switch_enabled);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.grace_period(), Duration::from_secs(2));
        assert!(config.process.enforce);
        assert_eq!(config.namespace(), Some("exam_ns"));
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_leading_bom_ignored() {
        let raw = format!("\u{feff}{}", MINIMAL);
        assert!(LockdownConfig::from_json(&raw).is_ok());
    }

    #[test]
    fn test_production_has_no_namespace() {
        let raw = MINIMAL.replace("\"testing\"", "\"production\"");
        let config = LockdownConfig::from_json(&raw).unwrap();
        assert_eq!(config.namespace(), None);
    }

    #[test]
    fn test_empty_domains_rejected() {
        let raw = MINIMAL.replace(r#"["codeforces.com", "*.codeforces.com"]"#, "[]");
        let err = LockdownConfig::from_json(&raw).unwrap_err();
        assert!(matches!(err, LockdownError::Config(_)));
    }

    #[test]
    fn test_bad_gateway_rejected() {
        let raw = MINIMAL.replace(
            r#""interface": "wg0","#,
            r#""interface": "wg0", "vpn_gateway": "not-an-ip","#,
        );
        assert!(LockdownConfig::from_json(&raw).is_err());
    }

    #[test]
    fn test_missing_object_rejected() {
        assert!(LockdownConfig::from_json("mode = testing").is_err());
    }
}
