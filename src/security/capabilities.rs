//! Privilege pre-flight
//!
//! A lockdown that starts without the privileges to finish is worse than
//! none: the tunnel could come up and the firewall fail halfway. The
//! orchestrator checks the effective capability set before touching
//! anything.
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────────────────────┐
//! │ Capability         │ Needed for                                   │
//! ├────────────────────┼──────────────────────────────────────────────┤
//! │ CAP_NET_ADMIN      │ iptables, ip route, ip netns, wg-quick       │
//! │ CAP_KILL           │ terminating other users' processes           │
//! │ CAP_SYS_PTRACE     │ reading /proc/<pid>/exe of other users       │
//! │                    │ (optional; without it those are fail-open)   │
//! └────────────────────┴──────────────────────────────────────────────┘
//! ```

use caps::{CapSet, Capability};
use tracing::{debug, warn};

use crate::error::{LockdownError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// PrivilegeCheck
// ═══════════════════════════════════════════════════════════════════════════
// Required capabilities abort the pre-flight when missing. Recommended ones
// only log a warning.
// ═══════════════════════════════════════════════════════════════════════════

pub struct PrivilegeCheck {
    required: Vec<Capability>,
    recommended: Vec<Capability>,
}

impl PrivilegeCheck {
    /// Nothing required.
    pub fn new() -> Self {
        Self {
            required: Vec::new(),
            recommended: Vec::new(),
        }
    }

    /// What a host-mode lockdown session needs.
    pub fn for_lockdown() -> Self {
        let mut check = Self::new();
        check
            .require(Capability::CAP_NET_ADMIN)
            .require(Capability::CAP_KILL)
            .recommend(Capability::CAP_SYS_PTRACE);
        check
    }

    pub fn require(&mut self, cap: Capability) -> &mut Self {
        self.required.push(cap);
        self
    }

    pub fn recommend(&mut self, cap: Capability) -> &mut Self {
        self.recommended.push(cap);
        self
    }

    pub fn required_count(&self) -> usize {
        self.required.len()
    }

    /// Required capabilities absent from the effective set.
    pub fn missing(&self) -> Vec<Capability> {
        self.required.iter().copied().filter(|cap| !has_effective(*cap)).collect()
    }

    /// Fail with a configuration error naming every missing capability.
    pub fn verify(&self) -> Result<()> {
        for cap in &self.recommended {
            if !has_effective(*cap) {
                warn!(capability = cap_name(*cap), "recommended capability missing");
            }
        }

        let missing = self.missing();
        if missing.is_empty() {
            debug!(checked = self.required.len(), "privilege check passed");
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|cap| cap_name(*cap)).collect();
        Err(LockdownError::Config(format!(
            "missing required capabilities: {}",
            names.join(", ")
        )))
    }
}

impl Default for PrivilegeCheck {
    fn default() -> Self {
        Self::for_lockdown()
    }
}

fn has_effective(cap: Capability) -> bool {
    caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false)
}

// ═══════════════════════════════════════════════════════════════════════════
// Helper Functions
// ═══════════════════════════════════════════════════════════════════════════

/// Readable capability name
pub fn cap_name(cap: Capability) -> &'static str {
    match cap {
        Capability::CAP_NET_ADMIN => "CAP_NET_ADMIN",
        Capability::CAP_KILL => "CAP_KILL",
        Capability::CAP_SYS_PTRACE => "CAP_SYS_PTRACE",
        Capability::CAP_SYS_ADMIN => "CAP_SYS_ADMIN",
        Capability::CAP_NET_RAW => "CAP_NET_RAW",
        Capability::CAP_DAC_OVERRIDE => "CAP_DAC_OVERRIDE",
        Capability::CAP_DAC_READ_SEARCH => "CAP_DAC_READ_SEARCH",
        Capability::CAP_SETUID => "CAP_SETUID",
        Capability::CAP_SETGID => "CAP_SETGID",
        _ => "OTHER_CAP",
    }
}

/// Effective and permitted sets, for `examlock check`.
pub fn describe_current_caps() -> String {
    let mut output = String::new();
    for (name, set) in [("Effective", CapSet::Effective), ("Permitted", CapSet::Permitted)] {
        output.push_str(&format!("  {}:", name));
        match caps::read(None, set) {
            Ok(caps) if caps.is_empty() => output.push_str(" (none)\n"),
            Ok(caps) => {
                let mut names: Vec<String> = caps.iter().map(|cap| cap.to_string()).collect();
                names.sort();
                output.push(' ');
                output.push_str(&names.join(", "));
                output.push('\n');
            }
            Err(_) => output.push_str(" (unable to read)\n"),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockdown_requirements() {
        let check = PrivilegeCheck::for_lockdown();
        assert_eq!(check.required_count(), 2);
    }

    #[test]
    fn test_empty_check_passes() {
        assert!(PrivilegeCheck::new().verify().is_ok());
    }

    #[test]
    fn test_missing_reported_by_name() {
        let mut check = PrivilegeCheck::new();
        check.require(Capability::CAP_NET_ADMIN);
        match check.verify() {
            Ok(()) => assert!(has_effective(Capability::CAP_NET_ADMIN)),
            Err(e) => assert!(e.to_string().contains("CAP_NET_ADMIN")),
        }
    }

    #[test]
    fn test_describe_lists_sets() {
        let text = describe_current_caps();
        assert!(text.contains("Effective:"));
        assert!(text.contains("Permitted:"));
    }
}
