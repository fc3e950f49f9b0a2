//! Security pre-conditions for a lockdown session
//!
//! - Capability pre-flight (`PrivilegeCheck`): the session must be able to
//!   finish what it starts.

pub mod capabilities;

pub use capabilities::{cap_name, describe_current_caps, PrivilegeCheck};
