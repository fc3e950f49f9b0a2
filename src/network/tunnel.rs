//! Secure tunnel supervision
//!
//! The tunnel is opaque: `wg-quick up/down` brings it up or down and
//! `wg show` is the liveness probe. In testing mode everything happens
//! inside a network namespace the supervisor creates on demand.
//!
//! Retries are the orchestrator's decision; every method here makes one
//! attempt.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, Auditor};
use crate::error::{LockdownError, Result};
use crate::exec::NetExec;

/// Tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Down,
    Establishing,
    Up,
    Failed,
}

pub struct TunnelSupervisor {
    exec: NetExec,
    interface: String,
    config_path: PathBuf,
    state: TunnelState,
    auditor: Arc<Auditor>,
    /// Namespace was created by us and is ours to delete
    created_namespace: bool,
    /// `ip route show default` output before we replaced it
    previous_route: Option<String>,
    route_replaced: bool,
}

impl TunnelSupervisor {
    pub fn new(exec: NetExec, interface: &str, config_path: PathBuf, auditor: Arc<Auditor>) -> Self {
        Self {
            exec,
            interface: interface.to_string(),
            config_path,
            state: TunnelState::Down,
            auditor,
            created_namespace: false,
            previous_route: None,
            route_replaced: false,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn transition(&mut self, to: TunnelState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.auditor.emit(AuditEvent::TunnelTransition {
            interface: self.interface.clone(),
            from,
            to,
        });
    }

    /// Bring the tunnel up. Non-zero status from the bring-up is a
    /// `Tunnel` error and leaves the state `Failed`.
    pub fn up(&mut self) -> Result<()> {
        self.transition(TunnelState::Establishing);

        if let Err(e) = self.ensure_namespace() {
            self.transition(TunnelState::Failed);
            return Err(e);
        }

        let config = self.config_path.to_string_lossy().to_string();
        let output = match self.exec.try_run("wg-quick", &["up", &config]) {
            Ok(output) => output,
            Err(e) => {
                self.transition(TunnelState::Failed);
                return Err(LockdownError::Tunnel(e.to_string()));
            }
        };
        if !output.success {
            self.transition(TunnelState::Failed);
            return Err(LockdownError::Tunnel(format!(
                "wg-quick up {} ({}): {}",
                config,
                output.status,
                output.stderr.trim()
            )));
        }

        self.transition(TunnelState::Up);
        info!(interface = %self.interface, config = %config, "tunnel up");
        Ok(())
    }

    fn ensure_namespace(&mut self) -> Result<()> {
        let Some(ns) = self.exec.namespace().map(str::to_string) else {
            return Ok(());
        };
        let added = self.exec.run_host("ip", &["netns", "add", &ns])?;
        if added.success {
            self.created_namespace = true;
            info!(namespace = %ns, "network namespace created");
        } else if added.stderr.contains("exists") {
            debug!(namespace = %ns, "network namespace already exists");
        } else {
            return Err(LockdownError::Tunnel(format!(
                "cannot create namespace {}: {}",
                ns,
                added.stderr.trim()
            )));
        }
        self.exec.run("ip", &["link", "set", "lo", "up"])?;
        Ok(())
    }

    /// Send all egress through the tunnel. The replaced route is kept and
    /// reinstated by [`down`](Self::down).
    pub fn configure_default_route(&mut self, gateway: &str, interface: &str) -> Result<()> {
        let current = self.exec.try_run("ip", &["route", "show", "default"])?;
        if current.success {
            let route = current.stdout.lines().next().unwrap_or("").trim().to_string();
            if !route.is_empty() && self.previous_route.is_none() {
                debug!(route = %route, "saved previous default route");
                self.previous_route = Some(route);
            }
        }

        // No default route is fine.
        let _ = self.exec.try_run("ip", &["route", "del", "default"])?;
        self.route_replaced = true;
        self.exec
            .run("ip", &["route", "add", "default", "via", gateway, "dev", interface])?;
        info!(gateway = gateway, interface = interface, "default route now via tunnel");
        Ok(())
    }

    /// Liveness probe.
    pub fn is_up(&self) -> bool {
        self.exec
            .try_run("wg", &["show", &self.interface])
            .map(|o| o.success)
            .unwrap_or(false)
    }

    /// Probe and record a transition if liveness changed.
    pub fn refresh(&mut self) -> bool {
        let alive = self.is_up();
        match (self.state, alive) {
            (TunnelState::Up, false) => {
                warn!(interface = %self.interface, "tunnel lost; kill switch holding");
                self.transition(TunnelState::Failed);
            }
            (TunnelState::Failed, true) => {
                info!(interface = %self.interface, "tunnel recovered");
                self.transition(TunnelState::Up);
            }
            _ => {}
        }
        alive
    }

    /// Tear down whatever `up` and `configure_default_route` did.
    /// Every step is attempted; the first failure is returned.
    pub fn down(&mut self) -> Result<()> {
        let mut first_error: Option<LockdownError> = None;

        if self.route_replaced {
            let _ = self.exec.try_run("ip", &["route", "del", "default"]);
            if let Some(route) = self.previous_route.take() {
                let mut args = vec!["route", "add"];
                args.extend(route.split_whitespace());
                if let Err(e) = self.exec.run("ip", &args) {
                    warn!(route = %route, error = %e, "could not reinstate previous default route");
                    first_error.get_or_insert(e);
                }
            }
            self.route_replaced = false;
        }

        if self.state != TunnelState::Down {
            let config = self.config_path.to_string_lossy().to_string();
            match self.exec.try_run("wg-quick", &["down", &config]) {
                Ok(output) if output.success => {}
                Ok(output) if self.state == TunnelState::Up => {
                    first_error.get_or_insert(LockdownError::Tunnel(format!(
                        "wg-quick down {}: {}",
                        config,
                        output.stderr.trim()
                    )));
                }
                Ok(_) => debug!("tunnel was not up; ignoring wg-quick down failure"),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if self.created_namespace {
            if let Some(ns) = self.exec.namespace().map(str::to_string) {
                match self.exec.run_host("ip", &["netns", "del", &ns]) {
                    Ok(output) if output.success => {
                        info!(namespace = %ns, "network namespace deleted");
                        self.created_namespace = false;
                    }
                    Ok(output) => {
                        first_error.get_or_insert(LockdownError::external(
                            "ip netns del",
                            output.status,
                            output.stderr,
                        ));
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        self.transition(TunnelState::Down);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
