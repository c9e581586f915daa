// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};

use crate::mount::{MountBackend, MountSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Spawned,
    Mounted,
    Running,
    /// Attaching failed, or the mount ended with an error.
    FailedToMount(String),
    /// The mount was released externally and the task finished.
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub index: usize,
    pub target: PathBuf,
    pub state: TaskState,
}

#[derive(Debug, Default)]
pub struct BarrierReport {
    pub events: Vec<TaskEvent>,
    pub failed: Option<PathBuf>,
}

impl BarrierReport {
    pub fn count(&self, state: &TaskState) -> usize {
        self.events.iter().filter(|e| &e.state == state).count()
    }
}

/// Spawns, supervises and tears down one mount per spec.
pub struct MountOrchestrator<B: MountBackend> {
    backend: Arc<B>,
    stagger: Duration,
}

fn run_task<B: MountBackend>(
    index: usize,
    spec: MountSpec,
    backend: Arc<B>,
    tx: mpsc::Sender<TaskEvent>,
) {
    let report = |state: TaskState| {
        let _ = tx.send(TaskEvent {
            index,
            target: spec.target_path.clone(),
            state,
        });
    };

    let _span = tracing::info_span!("mount", tag = %spec.fs_tag, index).entered();

    let handle = match backend.attach(&spec) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(
                target_path = %spec.target_path.display(),
                error = %format!("{e:#}"),
                "mount_fuse_error"
            );
            report(TaskState::FailedToMount(format!("{e:#}")));
            return;
        }
    };
    report(TaskState::Mounted);
    report(TaskState::Running);

    match handle.wait() {
        Ok(()) => report(TaskState::Exited),
        Err(e) => {
            tracing::error!(
                target_path = %spec.target_path.display(),
                error = %format!("{e:#}"),
                "mount_session_error"
            );
            report(TaskState::FailedToMount(format!("{e:#}")));
        }
    }
}

impl<B: MountBackend> MountOrchestrator<B> {
    pub fn new(backend: Arc<B>, stagger: Duration) -> Self {
        Self { backend, stagger }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mounts every [`MountSpec`] and blocks until all mounts end or one fails.
    pub fn start(&self, specs: Vec<MountSpec>) -> Result<BarrierReport> {
        let (tx, rx) = mpsc::channel();
        let total = specs.len();

        for (index, spec) in specs.into_iter().enumerate() {
            if index > 0 && !self.stagger.is_zero() {
                thread::sleep(self.stagger);
            }
            tracing::info!(
                target_path = %spec.target_path.display(),
                root = %spec.backing_root.display(),
                "mount_volume"
            );
            let _ = tx.send(TaskEvent {
                index,
                target: spec.target_path.clone(),
                state: TaskState::Spawned,
            });
            let backend = Arc::clone(&self.backend);
            let tx = tx.clone();
            thread::Builder::new()
                .name(format!("mount-{index}"))
                .spawn(move || run_task(index, spec, backend, tx))
                .context("Failed to spawn mount task")?;
        }
        drop(tx);

        let mut report = BarrierReport::default();
        let mut finished = 0;
        while finished < total {
            let Ok(event) = rx.recv() else {
                break;
            };
            tracing::debug!(index = event.index, state = ?event.state, "mount_task");
            let failed = matches!(event.state, TaskState::FailedToMount(_));
            if event.state == TaskState::Exited {
                finished += 1;
            }
            if failed {
                report.failed = Some(event.target.clone());
            }
            report.events.push(event);
            if failed {
                break;
            }
        }
        tracing::info!(failed = report.failed.is_some(), "mount_exit");
        Ok(report)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnmountReport {
    pub unmounted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Unmounts the data target, then every exposure directory, best-effort.
///
/// A directory whose unmount fails is removed so the next run starts clean.
pub fn unmount_all(
    backend: &dyn MountBackend,
    data_target: Option<&Path>,
    volumes_root: &Path,
) -> Result<UnmountReport> {
    let _privilege = backend.elevate()?;
    let mut report = UnmountReport::default();

    if let Some(target) = data_target {
        match backend.unmount(target) {
            Ok(()) => report.unmounted.push(target.to_path_buf()),
            Err(e) => {
                tracing::warn!(path = %target.display(), error = %format!("{e:#}"), "umount_data_target");
                report.failed.push(target.to_path_buf());
            }
        }
    }

    let entries = match fs::read_dir(volumes_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read {}", volumes_root.display()));
        }
    };

    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(true);
        if !is_dir {
            continue;
        }
        let path = entry.path();
        match backend.unmount(&path) {
            Ok(()) => report.unmounted.push(path),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %format!("{e:#}"), "umount_volumes");
                if fs::remove_dir(&path).is_ok() {
                    report.removed.push(path.clone());
                }
                report.failed.push(path);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashSet,
        sync::{Mutex, mpsc::Receiver},
    };

    use anyhow::bail;

    use super::*;
    use crate::{
        core::topology,
        mount::MountHandle,
        utils::PrivilegeGuard,
    };

    pub(crate) struct InstantHandle;

    impl MountHandle for InstantHandle {
        fn wait(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct BlockingHandle(Receiver<()>);

    impl MountHandle for BlockingHandle {
        fn wait(self: Box<Self>) -> Result<()> {
            let _ = self.0.recv();
            Ok(())
        }
    }

    /// Records mounts in memory; targets listed in `refuse` fail to attach.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub mounted: Mutex<HashSet<PathBuf>>,
        pub attached: Mutex<Vec<MountSpec>>,
        pub refuse: HashSet<PathBuf>,
        pub hold: Mutex<Vec<mpsc::Sender<()>>>,
        pub blocking: bool,
    }

    impl MountBackend for FakeBackend {
        fn attach(&self, spec: &MountSpec) -> Result<Box<dyn MountHandle>> {
            if self.refuse.contains(&spec.target_path) {
                bail!("refused {}", spec.target_path.display());
            }
            self.mounted.lock().unwrap().insert(spec.target_path.clone());
            self.attached.lock().unwrap().push(spec.clone());
            if self.blocking {
                let (tx, rx) = mpsc::channel();
                self.hold.lock().unwrap().push(tx);
                return Ok(Box::new(BlockingHandle(rx)));
            }
            Ok(Box::new(InstantHandle))
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            if self.mounted.lock().unwrap().remove(target) {
                Ok(())
            } else {
                bail!("{} is not mounted", target.display())
            }
        }

        fn elevate(&self) -> Result<Option<PrivilegeGuard>> {
            Ok(None)
        }
    }

    #[test]
    fn single_volume_reaches_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = topology::tests::fixture(dir.path());
        let specs = topology::resolve(&config).unwrap();
        assert_eq!(specs.len(), 1);

        let orchestrator = MountOrchestrator::new(Arc::new(FakeBackend::default()), Duration::ZERO);
        let report = orchestrator.start(specs).unwrap();
        assert_eq!(report.count(&TaskState::Running), 1);
        assert_eq!(report.count(&TaskState::Exited), 1);
        assert!(report.failed.is_none());
        let states: Vec<_> = report.events.iter().map(|e| e.state.clone()).collect();
        assert_eq!(
            states,
            vec![
                TaskState::Spawned,
                TaskState::Mounted,
                TaskState::Running,
                TaskState::Exited
            ]
        );
    }

    #[test]
    fn failed_mount_releases_barrier() {
        let backend = FakeBackend {
            refuse: HashSet::from([PathBuf::from("/volumes/bad")]),
            blocking: true,
            ..Default::default()
        };
        let orchestrator = MountOrchestrator::new(Arc::new(backend), Duration::from_millis(1));
        let specs = vec![
            MountSpec::new("/volumes/good", "/data", "bridgefs"),
            MountSpec::new("/volumes/bad", "/srv", "bridgefs"),
        ];
        let report = orchestrator.start(specs).unwrap();
        assert_eq!(report.failed, Some(PathBuf::from("/volumes/bad")));
        assert_eq!(report.count(&TaskState::Exited), 0);
        // release the still-running sibling
        orchestrator.backend().hold.lock().unwrap().clear();
    }

    #[test]
    fn empty_spec_list_returns_immediately() {
        let orchestrator = MountOrchestrator::new(Arc::new(FakeBackend::default()), Duration::ZERO);
        let report = orchestrator.start(Vec::new()).unwrap();
        assert!(report.events.is_empty());
        assert!(report.failed.is_none());
    }

    #[test]
    fn unmount_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = dir.path().join("volumes");
        fs::create_dir_all(volumes.join("a")).unwrap();
        fs::create_dir_all(volumes.join("b")).unwrap();
        fs::write(volumes.join(".fde_path_key"), "[]").unwrap();
        let target = dir.path().join("openfde");

        let backend = FakeBackend::default();
        for path in [volumes.join("a"), volumes.join("b"), target.clone()] {
            backend.mounted.lock().unwrap().insert(path);
        }

        let first = unmount_all(&backend, Some(&target), &volumes).unwrap();
        assert_eq!(first.unmounted.len(), 3);
        assert!(first.failed.is_empty());
        assert_eq!(first.unmounted[0], target);

        let second = unmount_all(&backend, Some(&target), &volumes).unwrap();
        assert!(second.unmounted.is_empty());
        assert_eq!(second.failed.len(), 3);
        assert_eq!(second.removed.len(), 2);
        assert!(!volumes.join("a").exists());
        assert!(volumes.join(".fde_path_key").exists());

        let third = unmount_all(&backend, Some(&target), &volumes).unwrap();
        assert_eq!(third.failed, vec![target]);
    }

    #[test]
    fn missing_volumes_root_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::default();
        let report = unmount_all(&backend, None, &dir.path().join("absent")).unwrap();
        assert_eq!(report, UnmountReport::default());
    }
}
