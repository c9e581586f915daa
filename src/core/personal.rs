// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    os::unix::fs::{DirBuilderExt, chown},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context, Result};
use procfs::process::{MountInfo, Process};

use super::{
    notify::{ContainerShell, Notifier},
    orchestrator::{BarrierReport, MountOrchestrator, UnmountReport},
    watch::{CancelToken, DirectoryWatchBridge, WatchSpec},
};
use crate::{
    conf::config::PersonalConfig,
    defs,
    fs::access::Identity,
    mount::{MountBackend, MountFlag, MountSpec},
    utils::{GateOutcome, poll_until},
};

const FOLDER_MODE: u32 = 0o755;

/// One personal folder under its two host spellings and its container name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderNames {
    pub default: &'static str,
    pub localized: &'static str,
    pub container: &'static str,
    pub desktop: bool,
}

pub static PERSONAL_FOLDERS: &[FolderNames] = &[
    FolderNames {
        default: "Documents",
        localized: "文档",
        container: "Documents",
        desktop: false,
    },
    FolderNames {
        default: "Downloads",
        localized: "下载",
        container: "Download",
        desktop: false,
    },
    FolderNames {
        default: "Music",
        localized: "音乐",
        container: "Music",
        desktop: false,
    },
    FolderNames {
        default: "Videos",
        localized: "视频",
        container: "Movies",
        desktop: false,
    },
    FolderNames {
        default: "Pictures",
        localized: "图片",
        container: "Pictures",
        desktop: false,
    },
    FolderNames {
        default: "Desktop",
        localized: "桌面",
        container: "Desktop",
        desktop: true,
    },
];

/// A host folder and the container-side directory it is served at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPair {
    pub host: PathBuf,
    pub container: PathBuf,
    pub container_name: &'static str,
    pub desktop: bool,
}

fn selected(table: &[FolderNames], include_desktop: bool) -> impl Iterator<Item = &FolderNames> {
    table.iter().filter(move |f| include_desktop || !f.desktop)
}

/// Picks the naming convention with more existing folders; ties go localized.
pub fn prefers_localized(home: &Path, table: &[FolderNames]) -> bool {
    let default = table.iter().filter(|f| home.join(f.default).is_dir()).count();
    let localized = table.iter().filter(|f| home.join(f.localized).is_dir()).count();
    default <= localized
}

fn create_owned_dir(path: &Path, owner: Identity) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(FOLDER_MODE)
        .create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    chown(path, Some(owner.uid), Some(owner.gid))
        .with_context(|| format!("Failed to chown {}", path.display()))
}

/// Resolves host/container pairs, creating missing host folders for `owner`.
pub fn resolve_folders(
    home: &Path,
    container_root: &Path,
    table: &[FolderNames],
    include_desktop: bool,
    owner: Identity,
) -> Result<Vec<FolderPair>> {
    let localized = prefers_localized(home, table);
    tracing::debug!(localized, home = %home.display(), "personal_naming");

    let mut pairs = Vec::new();
    for names in selected(table, include_desktop) {
        let host = home.join(if localized {
            names.localized
        } else {
            names.default
        });
        if !host.is_dir() {
            create_owned_dir(&host, owner)?;
            tracing::info!(path = %host.display(), "personal_dir_created");
        }
        pairs.push(FolderPair {
            host,
            container: container_root.join(names.container),
            container_name: names.container,
            desktop: names.desktop,
        });
    }
    Ok(pairs)
}

pub trait MountProbe: Send + Sync {
    /// Number of live mounts whose filesystem type is `fs_type`.
    fn count(&self, fs_type: &str) -> Result<usize>;
}

/// Mounts whose type is exactly `fs_type`; `fuse.bridgefs` does not match
/// `fuse.bridgefs2`.
pub fn count_fs_type<'a>(mounts: impl IntoIterator<Item = &'a MountInfo>, fs_type: &str) -> usize {
    mounts.into_iter().filter(|m| m.fs_type == fs_type).count()
}

pub struct ProcMountProbe;

impl MountProbe for ProcMountProbe {
    fn count(&self, fs_type: &str) -> Result<usize> {
        let mounts = Process::myself()
            .context("Failed to open own process")?
            .mountinfo()
            .context("Failed to read mountinfo")?;
        Ok(count_fs_type(&mounts, fs_type))
    }
}

static PROBE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Absent,
    Partial(usize),
    Complete,
}

pub fn probe_state(probe: &dyn MountProbe, fs_tag: &str, expected: usize) -> Result<MountState> {
    let _lock = PROBE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let count = probe.count(&format!("fuse.{fs_tag}"))?;
    Ok(match count {
        0 => MountState::Absent,
        n if n >= expected => MountState::Complete,
        n => MountState::Partial(n),
    })
}

#[derive(Debug)]
pub enum PersonalOutcome {
    AlreadyMounted,
    Mounted(BarrierReport),
}

/// Second-stage bridge of the user's personal folders into the container.
pub struct PersonalFolderBridge<B: MountBackend> {
    config: PersonalConfig,
    home: PathBuf,
    container_root: PathBuf,
    owner: Identity,
    orchestrator: MountOrchestrator<B>,
    probe: Arc<dyn MountProbe>,
    shell: Arc<dyn ContainerShell>,
    notifier: Arc<dyn Notifier>,
}

impl<B: MountBackend> PersonalFolderBridge<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PersonalConfig,
        home: impl Into<PathBuf>,
        container_root: impl Into<PathBuf>,
        owner: Identity,
        backend: Arc<B>,
        stagger: Duration,
        probe: Arc<dyn MountProbe>,
        shell: Arc<dyn ContainerShell>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            home: home.into(),
            container_root: container_root.into(),
            owner,
            orchestrator: MountOrchestrator::new(backend, stagger),
            probe,
            shell,
            notifier,
        }
    }

    fn expected(&self) -> usize {
        selected(PERSONAL_FOLDERS, self.config.include_desktop).count()
    }

    fn folders(&self) -> Result<Vec<FolderPair>> {
        resolve_folders(
            &self.home,
            &self.container_root,
            PERSONAL_FOLDERS,
            self.config.include_desktop,
            self.owner,
        )
    }

    fn container_ready(&self) -> bool {
        let script = format!("cat /proc/mounts |grep {}", self.config.passthrough_probe);
        match self.shell.run(&script, self.config.container_gate_timeout()) {
            Ok(out) => !out.trim().is_empty(),
            Err(e) => {
                tracing::debug!(error = %format!("{e:#}"), "container_probe");
                false
            }
        }
    }

    fn wait_for_gates(&self, pairs: &[FolderPair]) {
        let interval = self.config.gate_interval();

        let outcome = poll_until(interval, self.config.container_gate_timeout(), || {
            self.container_ready()
        });
        if outcome == GateOutcome::TimedOut {
            tracing::warn!(gate = "container", "gate_timeout");
        }

        let outcome = poll_until(interval, self.config.dirs_gate_timeout(), || {
            pairs.iter().all(|p| p.container.is_dir())
        });
        if outcome == GateOutcome::TimedOut {
            tracing::warn!(gate = "target_dirs", "gate_timeout");
            for pair in pairs.iter().filter(|p| !p.container.is_dir()) {
                if let Err(e) = fs::create_dir_all(&pair.container) {
                    tracing::warn!(path = %pair.container.display(), error = %e, "target_dir_create");
                }
            }
        }
    }

    fn spawn_watches(&self, pairs: &[FolderPair], cancel: &CancelToken) -> Vec<JoinHandle<Result<()>>> {
        let mut specs = vec![WatchSpec::applications(
            &self.config.applications_dir,
            defs::DESKTOP_FILE_SUFFIX,
        )];
        if let Some(desktop) = pairs.iter().find(|p| p.desktop) {
            specs.push(WatchSpec::desktop(
                &desktop.host,
                self.config.container_media_prefix.join(desktop.container_name),
            ));
        }

        let mut handles = Vec::new();
        for spec in specs {
            let bridge = DirectoryWatchBridge::new(spec, Arc::clone(&self.notifier), cancel.clone());
            match Arc::new(bridge).spawn() {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(error = %format!("{e:#}"), "watch_spawn"),
            }
        }
        handles
    }

    /// Gates, then mounts every folder unless the bridge is already complete.
    pub fn mount(&self) -> Result<PersonalOutcome> {
        let pairs = self.folders()?;
        self.wait_for_gates(&pairs);

        match probe_state(self.probe.as_ref(), &self.config.fs_tag, pairs.len())? {
            MountState::Complete => {
                tracing::info!(tag = %self.config.fs_tag, "personal_already_mounted");
                return Ok(PersonalOutcome::AlreadyMounted);
            }
            MountState::Partial(count) => {
                tracing::warn!(count, expected = pairs.len(), "personal_partial_mount");
                self.unmount()?;
            }
            MountState::Absent => {}
        }

        let cancel = CancelToken::new();
        let watches = self.spawn_watches(&pairs, &cancel);

        let specs = pairs
            .iter()
            .map(|p| {
                MountSpec::new(&p.container, &p.host, &self.config.fs_tag)
                    .with_flag(MountFlag::NonEmpty)
            })
            .collect();
        let report = self.orchestrator.start(specs);

        cancel.cancel();
        for handle in watches {
            match handle.join() {
                Ok(Err(e)) => tracing::warn!(error = %format!("{e:#}"), "watch_exit"),
                Err(_) => tracing::error!("watch_panicked"),
                Ok(Ok(())) => {}
            }
        }
        Ok(PersonalOutcome::Mounted(report?))
    }

    pub fn query(&self) -> Result<bool> {
        let state = probe_state(self.probe.as_ref(), &self.config.fs_tag, self.expected())?;
        Ok(state == MountState::Complete)
    }

    pub fn unmount(&self) -> Result<UnmountReport> {
        unmount_folders(
            self.orchestrator.backend(),
            &self.container_root,
            self.config.include_desktop,
        )
    }
}

/// Unmounts every container-side folder, best-effort.
pub fn unmount_folders(
    backend: &dyn MountBackend,
    container_root: &Path,
    include_desktop: bool,
) -> Result<UnmountReport> {
    let _privilege = backend.elevate()?;
    let mut report = UnmountReport::default();
    for names in selected(PERSONAL_FOLDERS, include_desktop) {
        let target = container_root.join(names.container);
        match backend.unmount(&target) {
            Ok(()) => report.unmounted.push(target),
            Err(e) => {
                tracing::warn!(path = %target.display(), error = %format!("{e:#}"), "umount_personal");
                report.failed.push(target);
            }
        }
    }
    Ok(report)
}
