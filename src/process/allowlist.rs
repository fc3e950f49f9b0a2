//! Process allowlist
//!
//! Persisted as one JSON record:
//!
//! ```text
//! {
//!   "processes": ["bash", "firefox", "sleep"],
//!   "paths":     ["/usr/bin/firefox", "/usr/lib/python3"],
//!   "checksums": { "/usr/bin/firefox": "9f86d081884c7d65..." }
//! }
//! ```
//!
//! A path entry also trusts everything below it, so a whole installation
//! directory can be allowed at once. Digests are SHA-256, lowercase hex.
//!
//! During a session the store is shared as `Arc<AllowlistStore>`; every
//! mutator takes `&mut self`, so a running session cannot change it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{LockdownError, Result};

/// One permitted identity, as added by an author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowlistEntry {
    pub name: String,
    pub path: Option<PathBuf>,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistStore {
    #[serde(default)]
    processes: BTreeSet<String>,
    #[serde(default)]
    paths: BTreeSet<PathBuf>,
    #[serde(default)]
    checksums: BTreeMap<PathBuf, String>,
}

/// SHA-256 of a file's contents, lowercase hex.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

impl AllowlistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a store. A missing file is an error; see [`load_or_default`](Self::load_or_default).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let store: Self = serde_json::from_str(&raw)?;
        debug!(
            path = %path.display(),
            processes = store.processes.len(),
            paths = store.paths.len(),
            checksums = store.checksums.len(),
            "allowlist loaded"
        );
        Ok(store)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the whole store, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), processes = self.processes.len(), "allowlist saved");
        Ok(())
    }

    /// Add a name, optionally with an absolute path and its digest.
    ///
    /// Re-adding a known name only adds associations; an existing digest is
    /// never replaced.
    pub fn add_entry(&mut self, name: &str, path: Option<&Path>, compute_digest: bool) -> Result<AllowlistEntry> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LockdownError::Config("allowlist name must not be empty".into()));
        }
        self.processes.insert(name.to_string());

        let mut digest = None;
        if let Some(path) = path {
            if !path.is_absolute() {
                return Err(LockdownError::Config(format!(
                    "allowlist path must be absolute: {}",
                    path.display()
                )));
            }
            self.paths.insert(path.to_path_buf());

            if compute_digest {
                if let Some(existing) = self.checksums.get(path) {
                    digest = Some(existing.clone());
                } else if path.is_file() {
                    let computed = file_digest(path)?;
                    self.checksums.insert(path.to_path_buf(), computed.clone());
                    digest = Some(computed);
                } else {
                    warn!(path = %path.display(), "not a regular file, no digest recorded");
                }
            }
        }

        debug!(name = name, path = ?path, digest = digest.is_some(), "allowlist entry added");
        Ok(AllowlistEntry {
            name: name.to_string(),
            path: path.map(Path::to_path_buf),
            digest,
        })
    }

    /// Add bare names (e.g. a snapshot of currently running programs).
    pub fn import_names<I, S>(&mut self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.processes.len();
        for name in names {
            let name = name.as_ref().trim();
            if !name.is_empty() {
                self.processes.insert(name.to_string());
            }
        }
        self.processes.len() - before
    }

    /// Remove a name together with paths (and their digests) named after it.
    pub fn remove_entry(&mut self, name: &str) -> bool {
        let removed = self.processes.remove(name);
        let paths: Vec<PathBuf> = self
            .paths
            .iter()
            .filter(|p| p.file_name().map(|f| f == name).unwrap_or(false))
            .cloned()
            .collect();
        for path in &paths {
            self.paths.remove(path);
            self.checksums.remove(path);
        }
        removed || !paths.is_empty()
    }

    pub fn clear(&mut self) {
        self.processes.clear();
        self.paths.clear();
        self.checksums.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty() && self.paths.is_empty()
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.processes
    }

    pub fn paths(&self) -> &BTreeSet<PathBuf> {
        &self.paths
    }

    pub fn checksums(&self) -> &BTreeMap<PathBuf, String> {
        &self.checksums
    }

    /// Names with the stored paths whose file name matches them.
    pub fn entries(&self) -> Vec<AllowlistEntry> {
        let mut entries = Vec::new();
        for name in &self.processes {
            let matching: Vec<&PathBuf> = self
                .paths
                .iter()
                .filter(|p| p.file_name().map(|f| f == name.as_str()).unwrap_or(false))
                .collect();
            if matching.is_empty() {
                entries.push(AllowlistEntry {
                    name: name.clone(),
                    path: None,
                    digest: None,
                });
            }
            for path in matching {
                entries.push(AllowlistEntry {
                    name: name.clone(),
                    path: Some(path.clone()),
                    digest: self.checksums.get(path).cloned(),
                });
            }
        }
        entries
    }

    /// Exact name, exact path, or a stored path that is an ancestor of `path`.
    pub fn is_allowed(&self, name: Option<&str>, path: Option<&Path>) -> bool {
        if let Some(name) = name {
            if self.processes.contains(name) {
                return true;
            }
        }
        if let Some(path) = path {
            if self.paths.contains(path) {
                return true;
            }
            if self.paths.iter().any(|allowed| path.starts_with(allowed)) {
                return true;
            }
        }
        false
    }

    /// True when no digest is recorded for `path` or the file still matches.
    pub fn validate_digest(&self, path: &Path) -> bool {
        let Some(expected) = self.checksums.get(path) else {
            return true;
        };
        match file_digest(path) {
            Ok(actual) => &actual == expected,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read file for digest check");
                false
            }
        }
    }

    /// Check every recorded digest; the first mismatch is returned.
    pub fn verify_digests(&self) -> Result<()> {
        for (path, expected) in &self.checksums {
            let actual = match file_digest(path) {
                Ok(actual) => actual,
                Err(e) => format!("unreadable ({})", e),
            };
            if &actual != expected {
                return Err(LockdownError::Integrity {
                    path: path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        debug!(checked = self.checksums.len(), "allowlist digests verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_add_entry_is_idempotent_and_additive() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_file(dir.path(), "firefox", "binary");
        let mut store = AllowlistStore::new();

        store.add_entry("firefox", None, false).unwrap();
        store.add_entry("firefox", Some(&bin), true).unwrap();
        store.add_entry("firefox", None, false).unwrap();

        assert_eq!(store.names().len(), 1);
        assert!(store.paths().contains(&bin));
        assert!(store.checksums().contains_key(&bin));
    }

    #[test]
    fn test_existing_digest_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_file(dir.path(), "tool", "v1");
        let mut store = AllowlistStore::new();
        let first = store.add_entry("tool", Some(&bin), true).unwrap();

        write_file(dir.path(), "tool", "v2");
        let second = store.add_entry("tool", Some(&bin), true).unwrap();
        assert_eq!(first.digest, second.digest);
        assert!(!store.validate_digest(&bin));
    }

    #[test]
    fn test_relative_path_rejected() {
        let mut store = AllowlistStore::new();
        assert!(store.add_entry("x", Some(Path::new("bin/x")), false).is_err());
    }

    #[test]
    fn test_is_allowed_matching() {
        let mut store = AllowlistStore::new();
        store.add_entry("sleep", None, false).unwrap();
        store.add_entry("python3", Some(Path::new("/usr/lib/python3")), false).unwrap();

        assert!(store.is_allowed(Some("sleep"), None));
        assert!(store.is_allowed(None, Some(Path::new("/usr/lib/python3"))));
        assert!(store.is_allowed(Some("pip"), Some(Path::new("/usr/lib/python3/dist/pip"))));
        assert!(!store.is_allowed(Some("cat"), Some(Path::new("/usr/bin/cat"))));
        assert!(!store.is_allowed(None, Some(Path::new("/usr/lib/python3.11/x"))));
        assert!(!store.is_allowed(None, None));
    }

    #[test]
    fn test_validate_digest() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_file(dir.path(), "editor", "original");
        let unrecorded = write_file(dir.path(), "other", "whatever");
        let mut store = AllowlistStore::new();
        store.add_entry("editor", Some(&bin), true).unwrap();

        assert!(store.validate_digest(&bin));
        assert!(store.validate_digest(&unrecorded));

        write_file(dir.path(), "editor", "tampered");
        assert!(!store.validate_digest(&bin));
        let err = store.verify_digests().unwrap_err();
        assert!(matches!(err, LockdownError::Integrity { .. }));
    }

    #[test]
    fn test_digest_is_lowercase_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "abc", "abc");
        assert_eq!(
            file_digest(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_file(dir.path(), "firefox", "binary");
        let mut store = AllowlistStore::new();
        store.add_entry("firefox", Some(&bin), true).unwrap();
        store.add_entry("sleep", None, false).unwrap();
        store.add_entry("python3", Some(Path::new("/usr/lib/python3")), false).unwrap();

        let file = dir.path().join("allowlist.json");
        store.save(&file).unwrap();
        let loaded = AllowlistStore::load(&file).unwrap();

        assert_eq!(loaded.names(), store.names());
        assert_eq!(loaded.paths(), store.paths());
        assert_eq!(loaded.checksums(), store.checksums());
        assert!(!dir.path().join("allowlist.json.tmp").exists());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut store = AllowlistStore::new();
        store.add_entry("nano", Some(Path::new("/usr/bin/nano")), false).unwrap();
        store.add_entry("vim", None, false).unwrap();

        assert!(store.remove_entry("nano"));
        assert!(!store.is_allowed(None, Some(Path::new("/usr/bin/nano"))));
        assert!(!store.remove_entry("nano"));

        assert_eq!(store.import_names(["bash", "vim", " "]), 1);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_entries_pair_names_with_paths() {
        let mut store = AllowlistStore::new();
        store.add_entry("nano", Some(Path::new("/usr/bin/nano")), false).unwrap();
        store.add_entry("bash", None, false).unwrap();

        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "bash");
        assert_eq!(entries[1].path.as_deref(), Some(Path::new("/usr/bin/nano")));
    }
}
