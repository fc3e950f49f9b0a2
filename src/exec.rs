//! External command execution
//!
//! Every firewall, route and tunnel change is an external program
//! (`iptables`, `ip`, `wg-quick`). They all go through a [`CommandRunner`] so
//! that:
//!
//! - each invocation carries a bounded timeout
//! - namespace isolation is applied in one place ([`NetExec`])
//! - tests can record the exact command sequence and inject failures
//!
//! ```text
//! FirewallRuleEngine ─┐
//! KillSwitch ─────────┼──► NetExec ──(ip netns exec ns)──► CommandRunner
//! TunnelSupervisor ───┘                                     ├─ SystemRunner
//!                                                           └─ RecordingRunner
//! ```

use std::io::{Read, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{LockdownError, Result};
use crate::metrics::COMMAND_FAILURES;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Text piped to the program's stdin (used by `*-restore`)
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Render as a shell-like line, for logs and dry runs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// What a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            status: "exit status: 0".to_string(),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            status: "exit status: 1".to_string(),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external programs.
///
/// `Err` means the program could not be run to completion (missing binary,
/// timeout). A program that ran and exited non-zero is `Ok` with
/// `success == false`; callers decide whether that is fatal.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

// ═══════════════════════════════════════════════════════════════════════════
// SystemRunner
// ═══════════════════════════════════════════════════════════════════════════
// Spawns the real program. stdout/stderr are drained on helper threads so a
// chatty program (iptables-save on a busy host) cannot fill the pipe and
// stall until the timeout.
// ═══════════════════════════════════════════════════════════════════════════

pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "running");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                COMMAND_FAILURES.with_label_values(&[&spec.program]).inc();
                LockdownError::external(&spec.program, "spawn failed", e.to_string())
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        // Fed from its own thread so a payload bigger than the pipe buffer
        // is still covered by the timeout below.
        let feeder = match (&spec.stdin, child.stdin.take()) {
            (Some(input), Some(stdin)) => Some(feed(stdin, input.clone())),
            _ => None,
        };

        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    COMMAND_FAILURES.with_label_values(&[&spec.program]).inc();
                    return Err(e.into());
                }
            }
            if start.elapsed() > self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                COMMAND_FAILURES.with_label_values(&[&spec.program]).inc();
                warn!(command = %spec.display(), timeout = ?self.timeout, "command timed out");
                return Err(LockdownError::external(
                    &spec.program,
                    format!("timed out after {:?}", self.timeout),
                    "",
                ));
            }
            thread::sleep(poll_interval);
        };

        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(command = %spec.display(), error = %e, "stdin not fully written"),
                Err(_) => warn!(command = %spec.display(), "stdin writer panicked"),
            }
        }

        let output = CommandOutput {
            success: status.success(),
            status: status.to_string(),
            stdout: stdout.map(join_reader).unwrap_or_default(),
            stderr: stderr.map(join_reader).unwrap_or_default(),
        };
        if !output.success {
            COMMAND_FAILURES.with_label_values(&[&spec.program]).inc();
        }
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

fn feed(mut stdin: ChildStdin, input: String) -> thread::JoinHandle<std::io::Result<()>> {
    // Dropping stdin when the thread ends closes the pipe.
    thread::spawn(move || stdin.write_all(input.as_bytes()))
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════
// RecordingRunner
// ═══════════════════════════════════════════════════════════════════════════
// Executes nothing. Records every command, answers with canned output, and
// can be told to fail any command whose rendered line contains a pattern.
// Backs `examlock rules` (print what activation would install) and tests.
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<CommandSpec>>,
    fail_patterns: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any command whose display line contains `pattern` exits non-zero.
    pub fn fail_on(&self, pattern: &str) -> &Self {
        if let Ok(mut patterns) = self.fail_patterns.lock() {
            patterns.push(pattern.to_string());
        }
        self
    }

    pub fn clear_failures(&self) {
        if let Ok(mut patterns) = self.fail_patterns.lock() {
            patterns.clear();
        }
    }

    /// Commands whose display line contains `pattern` return `output`.
    pub fn respond(&self, pattern: &str, output: CommandOutput) -> &Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((pattern.to_string(), output));
        }
        self
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Rendered command lines in issue order.
    pub fn lines(&self) -> Vec<String> {
        self.commands().iter().map(CommandSpec::display).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.clear();
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(spec.clone());
        }

        let failing = self
            .fail_patterns
            .lock()
            .map(|p| p.iter().any(|pattern| line.contains(pattern.as_str())))
            .unwrap_or(false);
        if failing {
            return Ok(CommandOutput::failed(format!("injected failure: {}", line)));
        }

        let canned = self.responses.lock().ok().and_then(|responses| {
            responses
                .iter()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, output)| output.clone())
        });
        Ok(canned.unwrap_or_else(|| CommandOutput::ok("")))
    }
}

/// Namespace-aware front end over a [`CommandRunner`].
///
/// In isolated mode every command is wrapped in `ip netns exec <ns>`.
#[derive(Clone)]
pub struct NetExec {
    runner: Arc<dyn CommandRunner>,
    namespace: Option<String>,
}

impl NetExec {
    pub fn new(runner: Arc<dyn CommandRunner>, namespace: Option<String>) -> Self {
        Self { runner, namespace }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Wrap `program args..` for the configured namespace.
    pub fn spec(&self, program: &str, args: &[&str]) -> CommandSpec {
        match &self.namespace {
            Some(ns) => {
                let mut wrapped = vec!["netns", "exec", ns.as_str(), program];
                wrapped.extend_from_slice(args);
                CommandSpec::new("ip", wrapped)
            }
            None => CommandSpec::new(program, args.iter().copied()),
        }
    }

    /// Run in the namespace; non-zero exit is an `ExternalTool` error.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_spec(self.spec(program, args))
    }

    /// Run in the namespace; non-zero exit is returned, not raised.
    pub fn try_run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run(&self.spec(program, args))
    }

    pub fn run_spec(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let output = self.runner.run(&spec)?;
        if output.success {
            Ok(output)
        } else {
            Err(LockdownError::external(
                spec.display(),
                output.status.clone(),
                output.stderr.trim().to_string(),
            ))
        }
    }

    /// Run outside any namespace (namespace management itself).
    pub fn run_host(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run(&CommandSpec::new(program, args.iter().copied()))
    }
}
