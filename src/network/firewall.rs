//! Domain-allowlist firewall
//!
//! Rules are modelled as data ([`Rule`], [`FirewallRuleSet`]) and rendered to
//! `iptables`/`ip6tables` arguments only at install time, so the same value
//! can be both installed and evaluated against a [`Probe`].
//!
//! # Activation order
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │ 1. snapshot        iptables-save / ip6tables-save    (host mode only)  │
//! │ 2. kill switch     policy DROP, flush, lo/est/tunnel ACCEPT, LOG       │
//! │ 3. EXAM_FILTER     lo, ESTABLISHED, DNS, one ACCEPT per IP, DROP       │
//! │ 4. EXAM_FILTER_V6  same, skipped when no IPv6 address resolved         │
//! │ 5. jump            -I OUTPUT 1 [-o <tun>] -j <chain>                   │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any failing step rolls the whole activation back. Since step 2 runs
//! before step 3, a partial allowlist install is still fail-closed.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::error::{LockdownError, Result};
use crate::exec::{CommandSpec, NetExec};
use crate::network::killswitch::KillSwitch;
use crate::network::resolver::ResolvedAddrs;

pub const CHAIN_V4: &str = "EXAM_FILTER";
pub const CHAIN_V6: &str = "EXAM_FILTER_V6";

/// Address family; each has its own tool set and chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn iptables(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    pub fn save_tool(&self) -> &'static str {
        match self {
            Family::V4 => "iptables-save",
            Family::V6 => "ip6tables-save",
        }
    }

    pub fn restore_tool(&self) -> &'static str {
        match self {
            Family::V4 => "iptables-restore",
            Family::V6 => "ip6tables-restore",
        }
    }

    pub fn chain(&self) -> &'static str {
        match self {
            Family::V4 => CHAIN_V4,
            Family::V6 => CHAIN_V6,
        }
    }

    pub fn of(ip: &IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn backup_file(&self) -> &'static str {
        match self {
            Family::V4 => "iptables.rules",
            Family::V6 => "ip6tables.rules",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

/// Rule target. `Log` is non-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Log(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// One match → target rule. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub established: bool,
    pub proto: Option<Proto>,
    pub dport: Option<u16>,
    pub dest: Option<IpAddr>,
    pub target: Target,
}

impl Rule {
    pub fn new(target: Target) -> Self {
        Self {
            in_iface: None,
            out_iface: None,
            established: false,
            proto: None,
            dport: None,
            dest: None,
            target,
        }
    }

    pub fn accept() -> Self {
        Self::new(Target::Accept)
    }

    pub fn drop() -> Self {
        Self::new(Target::Drop)
    }

    pub fn input(mut self, iface: &str) -> Self {
        self.in_iface = Some(iface.to_string());
        self
    }

    pub fn output(mut self, iface: &str) -> Self {
        self.out_iface = Some(iface.to_string());
        self
    }

    pub fn established(mut self) -> Self {
        self.established = true;
        self
    }

    pub fn port(mut self, proto: Proto, dport: u16) -> Self {
        self.proto = Some(proto);
        self.dport = Some(dport);
        self
    }

    pub fn to(mut self, dest: IpAddr) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Arguments after `-A <chain>`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(iface) = &self.in_iface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &self.out_iface {
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if self.established {
            args.extend(
                ["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED"].map(String::from),
            );
        }
        if let Some(proto) = self.proto {
            args.extend(["-p".to_string(), proto.as_str().to_string()]);
        }
        if let Some(port) = self.dport {
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        if let Some(dest) = self.dest {
            args.extend(["-d".to_string(), dest.to_string()]);
        }
        match &self.target {
            Target::Accept => args.extend(["-j", "ACCEPT"].map(String::from)),
            Target::Drop => args.extend(["-j", "DROP"].map(String::from)),
            Target::Log(prefix) => {
                args.extend(["-j", "LOG", "--log-prefix"].map(String::from));
                args.push(prefix.clone());
            }
        }
        args
    }

    /// Whether an outbound packet matches. Rules keyed on an input
    /// interface never match outbound traffic.
    pub fn matches(&self, probe: &Probe) -> bool {
        if self.in_iface.is_some() {
            return false;
        }
        if let Some(iface) = &self.out_iface {
            if iface != &probe.out_iface {
                return false;
            }
        }
        if self.established && !probe.established {
            return false;
        }
        if let Some(proto) = self.proto {
            if proto != probe.proto {
                return false;
            }
        }
        if let Some(port) = self.dport {
            if port != probe.dport {
                return false;
            }
        }
        if let Some(dest) = self.dest {
            if dest != probe.dest {
                return false;
            }
        }
        true
    }
}

/// An outbound packet, for rule evaluation.
#[derive(Debug, Clone)]
pub struct Probe {
    pub out_iface: String,
    pub dest: IpAddr,
    pub proto: Proto,
    pub dport: u16,
    pub established: bool,
}

impl Probe {
    /// New outbound TCP connection.
    pub fn tcp(out_iface: &str, dest: IpAddr, dport: u16) -> Self {
        Self {
            out_iface: out_iface.to_string(),
            dest,
            proto: Proto::Tcp,
            dport,
            established: false,
        }
    }

    pub fn udp(out_iface: &str, dest: IpAddr, dport: u16) -> Self {
        Self {
            proto: Proto::Udp,
            ..Self::tcp(out_iface, dest, dport)
        }
    }

    pub fn established(mut self) -> Self {
        self.established = true;
        self
    }
}

/// First terminal match wins; `Log` falls through.
pub(crate) fn first_verdict(rules: &[Rule], probe: &Probe) -> Option<Verdict> {
    rules.iter().find_map(|rule| {
        if !rule.matches(probe) {
            return None;
        }
        match rule.target {
            Target::Accept => Some(Verdict::Accept),
            Target::Drop => Some(Verdict::Drop),
            Target::Log(_) => None,
        }
    })
}

/// Ordered allowlist chain for one family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRuleSet {
    pub family: Family,
    pub chain: String,
    pub rules: Vec<Rule>,
}

impl FirewallRuleSet {
    /// loopback, ESTABLISHED,RELATED, DNS, one ACCEPT per address, DROP.
    pub fn allowlist<I>(family: Family, addrs: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut rules = vec![
            Rule::accept().output("lo"),
            Rule::accept().established(),
            Rule::accept().port(Proto::Udp, 53),
            Rule::accept().port(Proto::Tcp, 53),
        ];
        let unique: BTreeSet<IpAddr> = addrs.into_iter().filter(|ip| Family::of(ip) == family).collect();
        rules.extend(unique.into_iter().map(|ip| Rule::accept().to(ip)));
        rules.push(Rule::drop());
        Self {
            family,
            chain: family.chain().to_string(),
            rules,
        }
    }

    /// Chains to install for a resolution result.
    ///
    /// The IPv6 chain is omitted only when no IPv6 address resolved and the
    /// kill switch's default DROP already holds that family. Without the
    /// kill switch an empty IPv6 allow-set is still installed.
    pub fn for_resolved(addrs: &ResolvedAddrs, kill_switch: bool) -> Vec<Self> {
        let mut sets = vec![Self::allowlist(Family::V4, addrs.v4.iter().map(|ip| IpAddr::V4(*ip)))];
        if !addrs.v6.is_empty() || !kill_switch {
            sets.push(Self::allowlist(Family::V6, addrs.v6.iter().map(|ip| IpAddr::V6(*ip))));
        }
        sets
    }

    /// Verdict for an outbound packet that reaches this chain.
    pub fn verdict(&self, probe: &Probe) -> Verdict {
        // Terminal DROP guarantees a match; Drop covers a malformed set too.
        first_verdict(&self.rules, probe).unwrap_or(Verdict::Drop)
    }

    /// Destinations explicitly enumerated as ACCEPT.
    pub fn allowed_destinations(&self) -> BTreeSet<IpAddr> {
        self.rules
            .iter()
            .filter(|r| r.target == Target::Accept)
            .filter_map(|r| r.dest)
            .collect()
    }

    /// The last rule is an unconditional DROP.
    pub fn ends_in_drop(&self) -> bool {
        self.rules
            .last()
            .map(|r| r.target == Target::Drop && r.matches_everything())
            .unwrap_or(false)
    }
}

impl Rule {
    fn matches_everything(&self) -> bool {
        self.in_iface.is_none()
            && self.out_iface.is_none()
            && !self.established
            && self.proto.is_none()
            && self.dport.is_none()
            && self.dest.is_none()
    }
}

impl fmt::Display for FirewallRuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} chain {}:", self.family.iptables(), self.chain)?;
        for rule in &self.rules {
            writeln!(f, "  -A {} {}", self.chain, rule.to_args().join(" "))?;
        }
        Ok(())
    }
}

/// Engine settings derived from the lockdown configuration.
#[derive(Debug, Clone)]
pub struct FirewallOptions {
    pub tunnel_interface: String,
    pub kill_switch: bool,
    pub endpoint: Option<SocketAddr>,
    /// Where host-mode snapshots are written; `None` keeps them in memory only.
    pub backup_dir: Option<PathBuf>,
}

/// Installs and removes the kill switch and allowlist chains.
pub struct FirewallRuleEngine {
    exec: NetExec,
    options: FirewallOptions,
    /// (family, iptables-save output) taken before first activation
    snapshots: Vec<(Family, String)>,
    installed: Vec<FirewallRuleSet>,
    active: bool,
}

impl FirewallRuleEngine {
    pub fn new(exec: NetExec, options: FirewallOptions) -> Self {
        Self {
            exec,
            options,
            snapshots: Vec::new(),
            installed: Vec::new(),
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Chains installed by the last successful activation.
    pub fn installed(&self) -> &[FirewallRuleSet] {
        &self.installed
    }

    fn isolated(&self) -> bool {
        self.exec.namespace().is_some()
    }

    /// Install the kill switch and allowlist chains. All-or-nothing.
    pub fn activate(&mut self, addrs: &ResolvedAddrs) -> Result<()> {
        if self.active {
            return Err(LockdownError::InvalidState("firewall already active".into()));
        }
        self.check_backup_clean()?;
        if addrs.is_empty() {
            warn!("no addresses resolved; only loopback, DNS and established traffic will pass");
        }

        let sets = FirewallRuleSet::for_resolved(addrs, self.options.kill_switch);
        match self.install(&sets) {
            Ok(()) => {
                info!(
                    chains = sets.len(),
                    v4 = addrs.v4.len(),
                    v6 = addrs.v6.len(),
                    kill_switch = self.options.kill_switch,
                    "firewall activated"
                );
                self.installed = sets;
                self.active = true;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "firewall activation failed, rolling back");
                if let Err(rollback) = self.deactivate() {
                    error!(error = %rollback, "firewall rollback incomplete");
                }
                self.active = false;
                Err(e)
            }
        }
    }

    fn install(&mut self, sets: &[FirewallRuleSet]) -> Result<()> {
        if !self.isolated() && self.snapshots.is_empty() {
            self.snapshot()?;
        }

        if self.options.kill_switch {
            let kill_switch = KillSwitch::new(&self.options.tunnel_interface, self.options.endpoint);
            for family in Family::ALL {
                kill_switch.apply(&self.exec, family)?;
            }
        }

        for set in sets {
            self.install_chain(set)?;
        }
        Ok(())
    }

    fn install_chain(&self, set: &FirewallRuleSet) -> Result<()> {
        let tool = set.family.iptables();
        let chain = set.chain.as_str();

        let created = self.exec.try_run(tool, &["-N", chain])?;
        if !created.success {
            debug!(chain = chain, "chain exists, flushing");
            self.exec.run(tool, &["-F", chain])?;
        }

        for rule in &set.rules {
            let mut args = vec!["-A".to_string(), chain.to_string()];
            args.extend(rule.to_args());
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.exec.run(tool, &args)?;
        }

        let jump = self.jump_args(chain);
        let mut insert = vec!["-I", "OUTPUT", "1"];
        insert.extend(jump.iter().map(String::as_str));
        self.exec.run(tool, &insert)?;

        debug!(chain = chain, rules = set.rules.len(), "chain installed");
        Ok(())
    }

    /// Match + target of the OUTPUT jump. Scoped to the tunnel when the
    /// kill switch holds everything else.
    fn jump_args(&self, chain: &str) -> Vec<String> {
        let mut args = Vec::new();
        if self.options.kill_switch {
            args.extend(["-o".to_string(), self.options.tunnel_interface.clone()]);
        }
        args.extend(["-j".to_string(), chain.to_string()]);
        args
    }

    /// Fails when `backup_dir` still holds a snapshot nobody restored.
    ///
    /// After a crash those files are the only copy of the host's own rules
    /// while the live tables hold the leftover lockdown. A new snapshot would
    /// overwrite the former with the latter.
    pub fn check_backup_clean(&self) -> Result<()> {
        if self.isolated() || !self.snapshots.is_empty() {
            return Ok(());
        }
        let Some(dir) = &self.options.backup_dir else {
            return Ok(());
        };
        let stale: Vec<String> = Family::ALL
            .iter()
            .map(|family| dir.join(family.backup_file()))
            .filter(|path| path.exists())
            .map(|path| path.display().to_string())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        warn!(files = %stale.join(", "), "rule snapshot left by an earlier session");
        Err(LockdownError::Config(format!(
            "rule snapshot from an earlier session is still present ({}); run `examlock restore` first",
            stale.join(", ")
        )))
    }

    /// Save the current rule state of both families.
    fn snapshot(&mut self) -> Result<()> {
        let mut snapshots = Vec::new();
        for family in Family::ALL {
            let output = self.exec.run(family.save_tool(), &[])?;
            if let Some(dir) = &self.options.backup_dir {
                let path = dir.join(family.backup_file());
                let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, &output.stdout));
                match written {
                    Ok(()) => debug!(path = %path.display(), "rule snapshot written"),
                    Err(e) => warn!(path = %path.display(), error = %e, "could not persist rule snapshot"),
                }
            }
            snapshots.push((family, output.stdout));
        }
        self.snapshots = snapshots;
        info!("pre-lockdown rule state saved");
        Ok(())
    }

    /// Remove what activation installed.
    ///
    /// Namespace mode deletes the chains; host mode restores the snapshot.
    /// Safe to call repeatedly and after a partial activation.
    pub fn deactivate(&mut self) -> Result<()> {
        if self.isolated() {
            for family in Family::ALL {
                let tool = family.iptables();
                let chain = family.chain();
                let jump = self.jump_args(chain);
                let mut delete = vec!["-D", "OUTPUT"];
                delete.extend(jump.iter().map(String::as_str));
                // Missing jump or chain is the expected end state.
                let _ = self.exec.try_run(tool, &delete)?;
                let _ = self.exec.try_run(tool, &["-F", chain])?;
                let _ = self.exec.try_run(tool, &["-X", chain])?;
            }
            self.installed.clear();
            self.active = false;
            info!("firewall chains removed");
            Ok(())
        } else {
            self.restore()
        }
    }

    /// Reinstate the pre-lockdown rule state.
    ///
    /// Uses the in-memory snapshot, else the files in `backup_dir`. With
    /// neither, nothing is changed. If reinstating fails the DROP policies
    /// are re-asserted so the host stays closed.
    pub fn restore(&mut self) -> Result<()> {
        let snapshots = if self.snapshots.is_empty() {
            self.snapshots_from_disk()
        } else {
            self.snapshots.clone()
        };

        if snapshots.is_empty() {
            if self.active {
                warn!("no rule snapshot available; leaving lockdown rules in place");
            } else {
                debug!("no rule snapshot to restore");
            }
            return Ok(());
        }

        for (family, saved) in &snapshots {
            let spec = self.exec_spec(family.restore_tool()).with_stdin(saved.clone());
            if let Err(e) = self.exec.run_spec(spec) {
                error!(family = ?family, error = %e, "rule restore failed, holding default DROP");
                self.fail_closed();
                return Err(e);
            }
        }

        if let Some(dir) = &self.options.backup_dir {
            for (family, _) in &snapshots {
                let path = dir.join(family.backup_file());
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "could not remove rule snapshot");
                    }
                }
            }
        }

        self.snapshots.clear();
        self.installed.clear();
        self.active = false;
        info!("pre-lockdown rule state restored");
        Ok(())
    }

    fn exec_spec(&self, program: &str) -> CommandSpec {
        self.exec.spec(program, &[])
    }

    fn snapshots_from_disk(&self) -> Vec<(Family, String)> {
        let Some(dir) = &self.options.backup_dir else {
            return Vec::new();
        };
        Family::ALL
            .iter()
            .filter_map(|family| {
                let path = dir.join(family.backup_file());
                std::fs::read_to_string(&path).ok().map(|text| {
                    info!(path = %path.display(), "using on-disk rule snapshot");
                    (*family, text)
                })
            })
            .collect()
    }

    fn fail_closed(&self) {
        for family in Family::ALL {
            for chain in ["INPUT", "FORWARD", "OUTPUT"] {
                if let Err(e) = self.exec.run(family.iptables(), &["-P", chain, "DROP"]) {
                    error!(family = ?family, chain = chain, error = %e, "could not re-assert DROP policy");
                }
            }
        }
    }
}
