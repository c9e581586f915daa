// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::BTreeSet,
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use walkdir::WalkDir;

use super::notify::{ChangeEvent, Notifier, OpCode};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub root: PathBuf,
    /// Reported paths have `root` replaced by this prefix.
    pub prefix: Option<PathBuf>,
    pub kind: String,
    /// Only entries whose name ends with this are reported.
    pub suffix: Option<String>,
    /// Follow subdirectories as they appear and disappear.
    pub recursive: bool,
}

impl WatchSpec {
    pub fn applications(dir: impl Into<PathBuf>, suffix: &str) -> Self {
        Self {
            root: dir.into(),
            prefix: None,
            kind: "application".to_string(),
            suffix: Some(suffix.to_string()),
            recursive: false,
        }
    }

    pub fn desktop(dir: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            root: dir.into(),
            prefix: Some(prefix.into()),
            kind: "desktop".to_string(),
            suffix: None,
            recursive: true,
        }
    }

    fn reported(&self, path: &Path) -> PathBuf {
        match (&self.prefix, path.strip_prefix(&self.root)) {
            (Some(prefix), Ok(rel)) if rel.as_os_str().is_empty() => prefix.clone(),
            (Some(prefix), Ok(rel)) => prefix.join(rel),
            _ => path.to_path_buf(),
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        match &self.suffix {
            None => true,
            Some(suffix) => path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(suffix.as_str())),
        }
    }
}

/// Forwards create/delete events under one root to the container.
pub struct DirectoryWatchBridge {
    spec: WatchSpec,
    notifier: Arc<dyn Notifier>,
    cancel: CancelToken,
    armed: AtomicBool,
}

struct WatchSet {
    watcher: RecommendedWatcher,
    paths: BTreeSet<PathBuf>,
    root_ino: Option<u64>,
}

fn dir_ino(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_dir()).map(|m| m.ino())
}

impl WatchSet {
    fn add_tree(&mut self, root: &Path, recursive: bool) {
        let walker = WalkDir::new(root).max_depth(if recursive { usize::MAX } else { 0 });
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_dir() || self.paths.contains(entry.path()) {
                continue;
            }
            match self.watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.paths.insert(entry.path().to_path_buf());
                }
                Err(e) => {
                    tracing::debug!(path = %entry.path().display(), error = %e, "watch_add_skipped")
                }
            }
        }
    }

    fn remove_tree(&mut self, root: &Path) {
        let gone: Vec<PathBuf> = self
            .paths
            .iter()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect();
        for path in gone {
            let _ = self.watcher.unwatch(&path);
            self.paths.remove(&path);
        }
    }

    fn clear(&mut self) {
        for path in std::mem::take(&mut self.paths) {
            let _ = self.watcher.unwatch(&path);
        }
    }
}

impl DirectoryWatchBridge {
    pub fn new(spec: WatchSpec, notifier: Arc<dyn Notifier>, cancel: CancelToken) -> Self {
        Self {
            spec,
            notifier,
            cancel,
            armed: AtomicBool::new(false),
        }
    }

    /// True while the root is present and watched.
    pub fn armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let name = format!("watch-{}", self.spec.kind);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .context("Failed to spawn watch thread")
    }

    fn send(&self, path: &Path, op: OpCode) {
        let event = ChangeEvent {
            file_name: self.spec.reported(path).to_string_lossy().to_string(),
            op,
        };
        if let Err(e) = self.notifier.notify(&self.spec.kind, &event) {
            tracing::error!(file = %event.file_name, error = %format!("{e:#}"), "command_execution_error");
        }
    }

    fn handle(&self, set: &mut WatchSet, event: Event) {
        let op = match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                OpCode::Add
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                OpCode::Delete
            }
            _ => return,
        };
        for path in &event.paths {
            if path == &self.spec.root {
                continue;
            }
            match op {
                OpCode::Add if self.spec.recursive && path.is_dir() => {
                    set.add_tree(path, true);
                }
                OpCode::Delete if self.spec.recursive => set.remove_tree(path),
                _ => {}
            }
            if self.spec.accepts(path) {
                self.send(path, op);
            }
        }
    }

    /// Runs until cancelled, re-arming whenever the root reappears.
    pub fn run(&self) -> Result<()> {
        let _span = tracing::info_span!("watch", kind = %self.spec.kind).entered();
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let watcher = notify::recommended_watcher(tx).context("Failed to create watcher")?;
        let mut set = WatchSet {
            watcher,
            paths: BTreeSet::new(),
            root_ino: None,
        };
        tracing::info!(root = %self.spec.root.display(), kind = %self.spec.kind, "watch_dir");

        while !self.cancel.is_cancelled() {
            if set.paths.is_empty() {
                set.root_ino = dir_ino(&self.spec.root);
                if set.root_ino.is_some() {
                    set.add_tree(&self.spec.root, self.spec.recursive);
                }
                let armed = !set.paths.is_empty();
                self.armed.store(armed, Ordering::SeqCst);
                if !armed {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(event)) => self.handle(&mut set, event),
                Ok(Err(e)) => tracing::warn!(error = %e, "watch_error"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            // a recreated root carries a new inode and none of our watches
            if dir_ino(&self.spec.root) != set.root_ino {
                tracing::info!(root = %self.spec.root.display(), "watch_root_gone");
                set.clear();
                self.armed.store(false, Ordering::SeqCst);
            }
        }

        set.clear();
        self.armed.store(false, Ordering::SeqCst);
        tracing::info!(root = %self.spec.root.display(), "context_cancelled");
        Ok(())
    }
}
