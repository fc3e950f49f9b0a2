//! Process classification
//!
//! The escape-pattern check runs before the allowlist lookup: an allowed
//! interpreter running `python3 -c "import os; os.system(...)"` is still a
//! violation. The patterns are a heuristic layer; the firewall remains the
//! boundary.

use serde::{Deserialize, Serialize};

use crate::process::allowlist::AllowlistStore;
use crate::process::table::ProcessRecord;

/// Interpreter runtimes whose command lines are checked for escapes.
pub const INTERPRETERS: &[&str] = &["python", "perl", "ruby", "node", "php", "lua", "tclsh"];

/// Command-line fragments that indicate dynamic code execution or
/// subprocess spawning.
pub const ESCAPE_INDICATORS: &[&str] = &[
    "os.system",
    "subprocess",
    "import os",
    "__import__",
    "exec(",
    "eval(",
    "child_process",
    "popen",
    "system(",
];

/// Options through which a runtime takes its program from argv.
struct EvalFlags {
    runtime: &'static str,
    /// Short flags that run code given on the command line.
    short: &'static [char],
    /// Long options (without `--`) that do the same.
    long: &'static [&'static str],
    /// Argument-less short flags allowed ahead of an eval flag in one cluster (`-Ic`, `-lne`).
    cluster: &'static str,
    /// Options whose value is the next token.
    with_value: &'static [&'static str],
}

const EVAL_FLAGS: &[EvalFlags] = &[
    EvalFlags {
        runtime: "python",
        short: &['c'],
        long: &[],
        cluster: "bBdEhiIOPqRsSuvx",
        with_value: &["-W", "-X", "-Q"],
    },
    EvalFlags {
        runtime: "perl",
        short: &['e', 'E'],
        long: &[],
        cluster: "aclnpsStTuUwWX0123456789",
        with_value: &["-I", "-M", "-m"],
    },
    EvalFlags {
        runtime: "ruby",
        short: &['e'],
        long: &[],
        cluster: "acdlnpsvwWy0123456789",
        with_value: &["-I", "-r", "-C", "-E"],
    },
    EvalFlags {
        runtime: "node",
        short: &['e', 'p'],
        long: &["eval", "print"],
        cluster: "",
        with_value: &["-r", "--require", "--import", "--loader"],
    },
    EvalFlags {
        runtime: "php",
        short: &['r', 'R', 'B', 'E'],
        long: &[],
        cluster: "",
        with_value: &["-c", "-d", "-z"],
    },
    EvalFlags {
        runtime: "lua",
        short: &['e'],
        long: &[],
        cluster: "",
        with_value: &["-l"],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Allowed,
    ViolationPattern,
    ViolationUnknown,
}

impl Classification {
    pub fn is_violation(&self) -> bool {
        !matches!(self, Classification::Allowed)
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Allowed => "allowed",
            Classification::ViolationPattern => "pattern",
            Classification::ViolationUnknown => "unknown",
        }
    }
}

/// Classification with the reason behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub classification: Classification,
    pub reason: String,
}

pub fn is_interpreter(name: &str) -> bool {
    let lower = name.to_lowercase();
    INTERPRETERS.iter().any(|i| lower.contains(i))
}

/// The first escape indicator found in `cmdline`, if any.
pub fn escape_indicator(cmdline: &str) -> Option<&'static str> {
    let lower = cmdline.to_lowercase();
    ESCAPE_INDICATORS.iter().copied().find(|p| lower.contains(p))
}

/// The option through which interpreter `name` was handed inline code.
///
/// `cmdline` is argv joined by spaces, so quoting is already gone and each
/// whitespace-separated token is looked at on its own. Scanning stops at the
/// first operand (the script path), after which options belong to the script.
pub fn eval_flag<'a>(name: &str, cmdline: &'a str) -> Option<&'a str> {
    let lower = name.to_lowercase();
    let flags = EVAL_FLAGS.iter().find(|f| lower.contains(f.runtime))?;

    let mut args = cmdline.split_whitespace().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--" || arg == "-" || !arg.starts_with('-') {
            return None;
        }
        if let Some(long) = arg.strip_prefix("--") {
            let key = long.split('=').next().unwrap_or(long);
            if flags.long.contains(&key) {
                return Some(arg);
            }
            if flags.with_value.contains(&arg) {
                args.next();
            }
            continue;
        }
        if flags.with_value.contains(&arg) {
            args.next();
            continue;
        }
        for c in arg[1..].chars() {
            if flags.short.contains(&c) {
                return Some(arg);
            }
            if !flags.cluster.contains(c) {
                break;
            }
        }
    }
    None
}

pub fn classify(record: &ProcessRecord, allowlist: &AllowlistStore) -> Verdict {
    if is_interpreter(&record.name) {
        if let Some(flag) = eval_flag(&record.name, &record.cmdline) {
            return Verdict {
                classification: Classification::ViolationPattern,
                reason: format!("interpreter {} given inline code via {:?}", record.name, flag),
            };
        }
        if let Some(indicator) = escape_indicator(&record.cmdline) {
            return Verdict {
                classification: Classification::ViolationPattern,
                reason: format!("interpreter {} invoked with {:?}", record.name, indicator),
            };
        }
    }

    if allowlist.is_allowed(Some(&record.name), record.exe.as_deref()) {
        return Verdict {
            classification: Classification::Allowed,
            reason: "allowlisted".to_string(),
        };
    }

    Verdict {
        classification: Classification::ViolationUnknown,
        reason: match &record.exe {
            Some(exe) => format!("{} ({}) is not allowlisted", record.name, exe.display()),
            None => format!("{} is not allowlisted", record.name),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AllowlistStore {
        let mut store = AllowlistStore::new();
        store.add_entry("sleep", None, false).unwrap();
        store.add_entry("python3", Some(std::path::Path::new("/usr/bin/python3")), false).unwrap();
        store
    }

    #[test]
    fn test_allowed_by_name_and_path() {
        let allowlist = store();
        let by_name = ProcessRecord::new(10, "sleep");
        assert_eq!(classify(&by_name, &allowlist).classification, Classification::Allowed);

        let by_path = ProcessRecord::new(11, "py").with_exe("/usr/bin/python3");
        assert_eq!(classify(&by_path, &allowlist).classification, Classification::Allowed);
    }

    #[test]
    fn test_unknown() {
        let record = ProcessRecord::new(12, "cat").with_exe("/usr/bin/cat");
        let verdict = classify(&record, &store());
        assert_eq!(verdict.classification, Classification::ViolationUnknown);
        assert!(verdict.reason.contains("/usr/bin/cat"));
    }

    #[test]
    fn test_pattern_overrides_allowlist() {
        let record = ProcessRecord::new(13, "python3")
            .with_exe("/usr/bin/python3")
            .with_cmdline("python3 -c import os; os.system('nc -l 4444')");
        let verdict = classify(&record, &store());
        assert_eq!(verdict.classification, Classification::ViolationPattern);
    }

    #[test]
    fn test_interpreter_without_indicator_uses_allowlist() {
        let record = ProcessRecord::new(14, "python3")
            .with_exe("/usr/bin/python3")
            .with_cmdline("python3 /home/student/solution.py");
        assert_eq!(classify(&record, &store()).classification, Classification::Allowed);
    }

    #[test]
    fn test_inline_code_without_indicator_is_flagged() {
        // What /proc shows for: python3 -c 'print(open("/etc/passwd").read())'
        let record = ProcessRecord::new(15, "python3")
            .with_exe("/usr/bin/python3")
            .with_cmdline("python3 -c print(open(\"/etc/passwd\").read())");
        let verdict = classify(&record, &store());
        assert_eq!(verdict.classification, Classification::ViolationPattern);
        assert!(verdict.reason.contains("\"-c\""));
    }

    #[test]
    fn test_eval_flags_per_runtime() {
        assert_eq!(eval_flag("python3", "python3 -Ic 1+1"), Some("-Ic"));
        assert_eq!(eval_flag("python3", "/usr/bin/python3 -W ignore -c pass"), Some("-c"));
        assert_eq!(eval_flag("python3", "python3 -cpass"), Some("-cpass"));
        assert_eq!(eval_flag("perl", "perl -e print 1"), Some("-e"));
        assert_eq!(eval_flag("perl", "perl -lne print"), Some("-lne"));
        assert_eq!(eval_flag("perl", "perl -E say 1"), Some("-E"));
        assert_eq!(eval_flag("ruby", "ruby -e puts 1"), Some("-e"));
        assert_eq!(eval_flag("node", "node --eval 1"), Some("--eval"));
        assert_eq!(eval_flag("node", "node --print=1"), Some("--print=1"));
        assert_eq!(eval_flag("node", "node -p 1"), Some("-p"));
        assert_eq!(eval_flag("php", "php -r echo 1;"), Some("-r"));
        assert_eq!(eval_flag("lua5.4", "lua5.4 -e print(1)"), Some("-e"));
    }

    #[test]
    fn test_script_arguments_are_not_eval_flags() {
        assert_eq!(eval_flag("python3", "python3 solution.py -c config.ini"), None);
        assert_eq!(eval_flag("python3", "python3 -u solution.py"), None);
        assert_eq!(eval_flag("python3", "python3 -m pytest -e"), None);
        assert_eq!(eval_flag("php", "php -f index.php -r"), None);
        assert_eq!(eval_flag("bash", "bash -c id"), None);

        let record = ProcessRecord::new(16, "python3")
            .with_exe("/usr/bin/python3")
            .with_cmdline("python3 solution.py -c config.ini");
        assert_eq!(classify(&record, &store()).classification, Classification::Allowed);
    }

    #[test]
    fn test_shell_is_not_an_interpreter() {
        assert!(!is_interpreter("bash"));
        assert!(!is_interpreter("sh"));
        assert!(is_interpreter("Python3.11"));
        assert!(is_interpreter("nodejs"));
    }

    #[test]
    fn test_indicators_case_insensitive() {
        assert_eq!(escape_indicator("perl -E 'SYSTEM(\"id\")'"), Some("system("));
        assert_eq!(escape_indicator("node -e require('child_process')"), Some("child_process"));
        assert_eq!(escape_indicator("ruby script.rb"), None);
    }
}
