//! Process enumeration and identity resolution
//!
//! [`ProcFs`] reads Linux `/proc`. Records are rebuilt every scan and never
//! persisted.
//!
//! # Identity fields
//!
//! ```text
//! /proc/<pid>/stat     comm, state, ppid, flags (PF_KTHREAD), starttime
//! /proc/<pid>/cmdline  argv, NUL separated
//! /proc/<pid>/exe      executable (symlink, canonicalized)
//! /proc/<pid>          owner uid
//! /proc/stat           btime (boot time, for starttime)
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use nix::unistd::{sysconf, SysconfVar, Uid, User};
use serde::Serialize;
use thiserror::Error;

use crate::error::Result;

/// `comm` is truncated to this many bytes by the kernel.
const TASK_COMM_LEN: usize = 15;

const PF_KTHREAD: u64 = 0x0020_0000;

/// Snapshot of one process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub name: String,
    pub exe: Option<PathBuf>,
    pub cmdline: String,
    pub uid: Option<u32>,
    pub user: Option<String>,
    pub started: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub kernel_thread: bool,
}

impl ProcessRecord {
    /// Minimal record, for tests and synthetic tables.
    pub fn new(pid: u32, name: &str) -> Self {
        Self {
            pid,
            ppid: None,
            name: name.to_string(),
            exe: None,
            cmdline: String::new(),
            uid: None,
            user: None,
            started: None,
            kernel_thread: false,
        }
    }

    pub fn with_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = Some(exe.into());
        self
    }

    pub fn with_cmdline(mut self, cmdline: &str) -> Self {
        self.cmdline = cmdline.to_string();
        self
    }
}

/// Why a pid could not be resolved.
#[derive(Debug, Error)]
pub enum InspectError {
    /// Exited between enumeration and inspection.
    #[error("process exited")]
    Gone,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Source of live processes.
pub trait ProcessTable: Send + Sync {
    fn pids(&self) -> Result<Vec<u32>>;
    fn inspect(&self, pid: u32) -> std::result::Result<ProcessRecord, InspectError>;
}

/// `/proc` reader.
pub struct ProcFs {
    root: PathBuf,
    clock_ticks: u64,
    boot_time: Option<i64>,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let clock_ticks = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as u64,
            _ => 100,
        };
        let boot_time = read_boot_time(&root);
        Self {
            root,
            clock_ticks,
            boot_time,
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn start_time(&self, start_ticks: u64) -> Option<DateTime<Utc>> {
        let boot = self.boot_time?;
        let secs = boot + (start_ticks / self.clock_ticks) as i64;
        let nanos = ((start_ticks % self.clock_ticks) * 1_000_000_000 / self.clock_ticks) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }
}

fn read_boot_time(root: &Path) -> Option<i64> {
    let stat = fs::read_to_string(root.join("stat")).ok()?;
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

/// Fields of `/proc/<pid>/stat` we use.
#[derive(Debug, PartialEq, Eq)]
struct StatLine {
    comm: String,
    state: char,
    ppid: u32,
    flags: u64,
    start_ticks: u64,
}

/// `comm` may contain spaces and parentheses, so split on the last `)`.
fn parse_stat(raw: &str) -> Option<StatLine> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    let comm = raw.get(open + 1..close)?.to_string();
    let rest: Vec<&str> = raw.get(close + 1..)?.split_whitespace().collect();
    // rest[0] is field 3 (state); ppid field 4, flags field 9, starttime field 22
    Some(StatLine {
        comm,
        state: rest.first()?.chars().next()?,
        ppid: rest.get(1)?.parse().ok()?,
        flags: rest.get(6)?.parse().ok()?,
        start_ticks: rest.get(19)?.parse().ok()?,
    })
}

fn map_io(err: io::Error) -> InspectError {
    match err.kind() {
        io::ErrorKind::NotFound => InspectError::Gone,
        io::ErrorKind::PermissionDenied => InspectError::PermissionDenied(err.to_string()),
        _ => {
            // ESRCH surfaces as a raw os error when the task is reaped mid-read
            if err.raw_os_error() == Some(nix::libc::ESRCH) {
                InspectError::Gone
            } else {
                InspectError::Io(err)
            }
        }
    }
}

/// Extend a 15-byte `comm` with the matching `argv[0]` basename.
fn full_name(comm: &str, cmdline: &str) -> String {
    if comm.len() < TASK_COMM_LEN {
        return comm.to_string();
    }
    let argv0 = cmdline.split(' ').next().unwrap_or("");
    let base = Path::new(argv0)
        .file_name()
        .map(|b| b.to_string_lossy().to_string())
        .unwrap_or_default();
    if base.len() > comm.len() && base.starts_with(comm) {
        base
    } else {
        comm.to_string()
    }
}

/// Parse `/proc/stat` state for liveness: zombies count as dead.
pub(crate) fn stat_alive(raw: &str) -> bool {
    parse_stat(raw).map(|s| s.state != 'Z' && s.state != 'X').unwrap_or(false)
}

impl ProcessTable for ProcFs {
    fn pids(&self) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn inspect(&self, pid: u32) -> std::result::Result<ProcessRecord, InspectError> {
        let dir = self.pid_dir(pid);

        let raw_stat = fs::read_to_string(dir.join("stat")).map_err(map_io)?;
        let stat = parse_stat(&raw_stat).ok_or_else(|| {
            InspectError::Io(io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"))
        })?;
        let kernel_thread = stat.flags & PF_KTHREAD != 0;

        let cmdline = fs::read(dir.join("cmdline"))
            .map_err(map_io)?
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).to_string())
            .collect::<Vec<_>>()
            .join(" ");

        let exe = if kernel_thread {
            None
        } else {
            match fs::read_link(dir.join("exe")) {
                Ok(link) => {
                    let text = link.to_string_lossy();
                    let trimmed = PathBuf::from(text.trim_end_matches(" (deleted)"));
                    Some(fs::canonicalize(&trimmed).unwrap_or(trimmed))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if dir.exists() {
                        None
                    } else {
                        return Err(InspectError::Gone);
                    }
                }
                Err(e) => return Err(map_io(e)),
            }
        };

        let uid = fs::metadata(&dir).map_err(map_io)?.uid();
        let user = User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name);

        Ok(ProcessRecord {
            pid,
            ppid: Some(stat.ppid),
            name: full_name(&stat.comm, &cmdline),
            exe,
            cmdline,
            uid: Some(uid),
            user,
            started: self.start_time(stat.start_ticks),
            kernel_thread,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 5000 1000000 100 18446744073709551615";

    #[test]
    fn test_parse_stat_handles_parens() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.comm, "my (odd) proc");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.flags, 4194560);
        assert_eq!(stat.start_ticks, 5000);
    }

    #[test]
    fn test_kernel_thread_flag() {
        let kthread = "2 (kthreadd) S 0 0 0 0 -1 2129984 0 0 0 0 0 0 0 0 20 0 1 0 1 0 0 18446744073709551615";
        let stat = parse_stat(kthread).unwrap();
        assert!(stat.flags & PF_KTHREAD != 0);
        assert!(parse_stat(STAT).unwrap().flags & PF_KTHREAD == 0);
    }

    #[test]
    fn test_zombie_is_not_alive() {
        assert!(stat_alive(STAT));
        assert!(!stat_alive(&STAT.replacen(") S ", ") Z ", 1)));
        assert!(!stat_alive("garbage"));
    }

    #[test]
    fn test_truncated_comm_extended() {
        assert_eq!(
            full_name("chromium-browse", "/usr/lib/chromium/chromium-browser --kiosk"),
            "chromium-browser"
        );
        assert_eq!(full_name("chromium-browse", "/bin/other"), "chromium-browse");
        assert_eq!(full_name("cat", "/usr/bin/cat file"), "cat");
    }

    #[test]
    fn test_inspect_self() {
        let table = ProcFs::new();
        let pid = std::process::id();
        assert!(table.pids().unwrap().contains(&pid));

        let record = table.inspect(pid).unwrap();
        assert_eq!(record.pid, pid);
        assert!(!record.kernel_thread);
        assert!(record.exe.is_some());
        assert!(!record.cmdline.is_empty());
        assert!(record.started.is_some());
    }

    #[test]
    fn test_missing_pid_is_gone() {
        let table = ProcFs::new();
        assert!(matches!(table.inspect(u32::MAX - 1), Err(InspectError::Gone)));
    }
}
