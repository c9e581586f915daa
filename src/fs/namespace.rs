// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    io,
    os::unix::fs::MetadataExt,
    path::PathBuf,
    sync::Mutex,
};

/// Inode number of a process' pid namespace handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub u64);

/// Tells requests issued from this daemon's pid namespace apart from requests
/// issued inside the container.
#[derive(Debug)]
pub struct NamespaceClassifier {
    proc_root: PathBuf,
    own_pid: u32,
    own: Mutex<Option<NamespaceId>>,
}

impl Default for NamespaceClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceClassifier {
    pub fn new() -> Self {
        Self::with_proc_root("/proc", std::process::id())
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>, own_pid: u32) -> Self {
        Self {
            proc_root: proc_root.into(),
            own_pid,
            own: Mutex::new(None),
        }
    }

    pub fn read_namespace(&self, pid: u32) -> io::Result<NamespaceId> {
        let handle = self
            .proc_root
            .join(pid.to_string())
            .join("ns")
            .join("pid");
        fs::metadata(handle).map(|m| NamespaceId(m.ino()))
    }

    /// Own namespace, read on first use and cached afterwards. A failed read is
    /// not cached.
    fn own_namespace(&self) -> Option<NamespaceId> {
        let mut own = match self.own.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if own.is_none() {
            match self.read_namespace(self.own_pid) {
                Ok(id) => *own = Some(id),
                Err(e) => {
                    tracing::error!(pid = self.own_pid, error = %e, "record_ns");
                }
            }
        }
        *own
    }

    /// True when `caller_pid` shares this process' pid namespace. Any read
    /// failure classifies the caller as foreign.
    pub fn is_host_namespace(&self, caller_pid: u32) -> bool {
        let caller = match self.read_namespace(caller_pid) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(pid = caller_pid, error = %e, "read_name_space_fs");
                return false;
            }
        };
        self.own_namespace() == Some(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_host() {
        let classifier = NamespaceClassifier::new();
        assert!(classifier.is_host_namespace(std::process::id()));
        // cached path
        assert!(classifier.is_host_namespace(std::process::id()));
    }

    #[test]
    fn unknown_pid_fails_closed() {
        let classifier = NamespaceClassifier::new();
        assert!(!classifier.is_host_namespace(u32::MAX));
    }

    #[test]
    fn fake_proc_tree_compares_inodes() {
        let dir = tempfile::tempdir().unwrap();
        for pid in ["10", "20", "30"] {
            fs::create_dir_all(dir.path().join(pid).join("ns")).unwrap();
        }
        fs::write(dir.path().join("10/ns/pid"), "host").unwrap();
        fs::hard_link(dir.path().join("10/ns/pid"), dir.path().join("20/ns/pid")).unwrap();
        fs::write(dir.path().join("30/ns/pid"), "container").unwrap();

        let classifier = NamespaceClassifier::with_proc_root(dir.path(), 10);
        assert!(classifier.is_host_namespace(10));
        assert!(classifier.is_host_namespace(20));
        assert!(!classifier.is_host_namespace(30));
        assert!(!classifier.is_host_namespace(40));
    }

    #[test]
    fn unreadable_own_namespace_treats_everyone_as_foreign() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("20/ns")).unwrap();
        fs::write(dir.path().join("20/ns/pid"), "").unwrap();
        let classifier = NamespaceClassifier::with_proc_root(dir.path(), 10);
        assert!(!classifier.is_host_namespace(20));
    }
}
