//! Network lockdown
//!
//! - `resolver` - allowed domains to IPv4/IPv6 address sets
//! - `firewall` - allowlist chains, rule model, activation/restore engine
//! - `killswitch` - default-DROP base policy under the allowlist
//! - `tunnel` - tunnel bring-up, liveness and default route

pub mod firewall;
pub mod killswitch;
pub mod resolver;
pub mod tunnel;

pub use firewall::{Family, FirewallOptions, FirewallRuleEngine, FirewallRuleSet, Probe, Verdict};
pub use killswitch::KillSwitch;
pub use resolver::{DomainResolver, HostLookup, ResolvedAddrs, SystemLookup};
pub use tunnel::{TunnelState, TunnelSupervisor};
