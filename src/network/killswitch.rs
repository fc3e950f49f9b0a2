//! Fail-closed base policy
//!
//! The kill switch is the layer under the allowlist chains. It holds the
//! whole host (or namespace) at default DROP and lets through only:
//!
//! ```text
//! INPUT   -i lo ACCEPT
//!         ESTABLISHED,RELATED ACCEPT
//!         -i <tun> ACCEPT
//! OUTPUT  -o lo ACCEPT
//!         -o <tun> ACCEPT
//!         -d <endpoint> -p udp --dport <port> ACCEPT   (tunnel transport)
//!         LOG "[EXAM-KILLSWITCH] "
//! policy  DROP on INPUT, FORWARD, OUTPUT
//! ```
//!
//! While the tunnel is down nothing leaves through `<tun>`, so only
//! loopback and the tunnel transport itself can egress.

use std::net::SocketAddr;

use tracing::{debug, info};

use crate::error::Result;
use crate::exec::NetExec;
use crate::network::firewall::{first_verdict, Family, Probe, Proto, Rule, Target, Verdict};

pub const LOG_PREFIX: &str = "[EXAM-KILLSWITCH] ";

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];

/// The base rules for one family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasePolicy {
    pub family: Family,
    pub input: Vec<Rule>,
    pub output: Vec<Rule>,
}

impl BasePolicy {
    /// Outbound verdict from the base layer alone (chain policy is DROP).
    pub fn outbound_verdict(&self, probe: &Probe) -> Verdict {
        first_verdict(&self.output, probe).unwrap_or(Verdict::Drop)
    }
}

pub struct KillSwitch {
    tunnel_interface: String,
    endpoint: Option<SocketAddr>,
}

impl KillSwitch {
    pub fn new(tunnel_interface: &str, endpoint: Option<SocketAddr>) -> Self {
        Self {
            tunnel_interface: tunnel_interface.to_string(),
            endpoint,
        }
    }

    pub fn policy(&self, family: Family) -> BasePolicy {
        let tun = self.tunnel_interface.as_str();
        let input = vec![
            Rule::accept().input("lo"),
            Rule::accept().established(),
            Rule::accept().input(tun),
        ];

        let mut output = vec![Rule::accept().output("lo"), Rule::accept().output(tun)];
        if let Some(endpoint) = self.endpoint.filter(|ep| Family::of(&ep.ip()) == family) {
            output.push(Rule::accept().to(endpoint.ip()).port(Proto::Udp, endpoint.port()));
        }
        output.push(Rule::new(Target::Log(LOG_PREFIX.to_string())));

        BasePolicy { family, input, output }
    }

    /// Install the base policy for one family.
    ///
    /// Policies go to DROP before the flush, so there is no instant with an
    /// empty ACCEPT-policy table.
    pub fn apply(&self, exec: &NetExec, family: Family) -> Result<()> {
        let tool = family.iptables();
        for chain in BUILTIN_CHAINS {
            exec.run(tool, &["-P", chain, "DROP"])?;
        }
        exec.run(tool, &["-F"])?;
        exec.run(tool, &["-X"])?;

        let policy = self.policy(family);
        for (chain, rules) in [("INPUT", &policy.input), ("OUTPUT", &policy.output)] {
            for rule in rules {
                let mut args = vec!["-A".to_string(), chain.to_string()];
                args.extend(rule.to_args());
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                exec.run(tool, &args)?;
            }
        }

        debug!(family = ?family, interface = %self.tunnel_interface, "kill switch rules installed");
        info!(family = ?family, "kill switch engaged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use std::net::IpAddr;
    use std::sync::Arc;

    #[test]
    fn test_policy_set_before_flush() {
        let runner = Arc::new(RecordingRunner::new());
        let exec = NetExec::new(runner.clone(), None);
        KillSwitch::new("wg0", None).apply(&exec, Family::V4).unwrap();

        let lines = runner.lines();
        assert_eq!(&lines[..5], &[
            "iptables -P INPUT DROP",
            "iptables -P FORWARD DROP",
            "iptables -P OUTPUT DROP",
            "iptables -F",
            "iptables -X",
        ]);
        assert!(lines.contains(&"iptables -A OUTPUT -o wg0 -j ACCEPT".to_string()));
        assert!(lines.last().unwrap().contains("-j LOG --log-prefix"));
    }

    #[test]
    fn test_down_tunnel_drops_everything_but_loopback() {
        let ks = KillSwitch::new("wg0", None);
        let policy = ks.policy(Family::V4);
        let dest: IpAddr = "93.184.216.34".parse().unwrap();

        for iface in ["eth0", "wlan0", "docker0"] {
            assert_eq!(policy.outbound_verdict(&Probe::tcp(iface, dest, 443)), Verdict::Drop);
            assert_eq!(policy.outbound_verdict(&Probe::udp(iface, dest, 53)), Verdict::Drop);
            assert_eq!(
                policy.outbound_verdict(&Probe::tcp(iface, dest, 443).established()),
                Verdict::Drop
            );
        }
        assert_eq!(
            policy.outbound_verdict(&Probe::tcp("lo", "127.0.0.1".parse().unwrap(), 80)),
            Verdict::Accept
        );
    }

    #[test]
    fn test_endpoint_exception_is_narrow() {
        let endpoint: SocketAddr = "198.51.100.7:51820".parse().unwrap();
        let policy = KillSwitch::new("wg0", Some(endpoint)).policy(Family::V4);

        assert_eq!(
            policy.outbound_verdict(&Probe::udp("eth0", endpoint.ip(), 51820)),
            Verdict::Accept
        );
        assert_eq!(policy.outbound_verdict(&Probe::tcp("eth0", endpoint.ip(), 51820)), Verdict::Drop);
        assert_eq!(policy.outbound_verdict(&Probe::udp("eth0", endpoint.ip(), 53)), Verdict::Drop);

        // v4 endpoint does not open anything in the v6 table
        let v6 = KillSwitch::new("wg0", Some(endpoint)).policy(Family::V6);
        assert_eq!(v6.output.len(), 3);
    }
}
