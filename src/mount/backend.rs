// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use anyhow::{Context, Result, bail};
use fuser::{BackgroundSession, MountOption};
use rustix::mount::{UnmountFlags, unmount};

use crate::{
    fs::{BridgeSession, PassthroughFs, PassthroughOptions},
    utils::PrivilegeGuard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountFlag {
    AllowOther,
    /// Mount over a directory that already has entries.
    NonEmpty,
}

/// One filesystem instance to attach: serve `backing_root` at `target_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub target_path: PathBuf,
    pub backing_root: PathBuf,
    pub options: Vec<MountFlag>,
    pub fs_tag: String,
}

impl MountSpec {
    pub fn new(
        target_path: impl Into<PathBuf>,
        backing_root: impl Into<PathBuf>,
        fs_tag: impl Into<String>,
    ) -> Self {
        Self {
            target_path: target_path.into(),
            backing_root: backing_root.into(),
            options: vec![MountFlag::AllowOther],
            fs_tag: fs_tag.into(),
        }
    }

    pub fn with_flag(mut self, flag: MountFlag) -> Self {
        if !self.options.contains(&flag) {
            self.options.push(flag);
        }
        self
    }
}

/// A live mount. `wait` blocks for as long as the mount is served.
pub trait MountHandle {
    fn wait(self: Box<Self>) -> Result<()>;
}

pub trait MountBackend: Send + Sync + 'static {
    fn attach(&self, spec: &MountSpec) -> Result<Box<dyn MountHandle>>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Credential scope for privileged unmounts.
    fn elevate(&self) -> Result<Option<PrivilegeGuard>> {
        PrivilegeGuard::elevate().map(Some)
    }
}

struct FuseHandle(BackgroundSession);

impl MountHandle for FuseHandle {
    fn wait(self: Box<Self>) -> Result<()> {
        self.0.join();
        Ok(())
    }
}

/// Serves a [`PassthroughFs`] per [`MountSpec`] over a FUSE session.
pub struct FuseBackend {
    options: PassthroughOptions,
}

impl FuseBackend {
    pub fn new(options: PassthroughOptions) -> Self {
        Self { options }
    }

    fn mount_options(spec: &MountSpec) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(spec.fs_tag.clone()),
            MountOption::Subtype(spec.fs_tag.clone()),
        ];
        for flag in &spec.options {
            match flag {
                MountFlag::AllowOther => options.push(MountOption::AllowOther),
                // fuse3 mounts over populated directories unconditionally
                MountFlag::NonEmpty => {}
            }
        }
        options
    }
}

impl MountBackend for FuseBackend {
    fn attach(&self, spec: &MountSpec) -> Result<Box<dyn MountHandle>> {
        let fs = PassthroughFs::new(&spec.backing_root, self.options.clone());
        let session = fuser::spawn_mount2(
            BridgeSession::new(fs),
            &spec.target_path,
            &Self::mount_options(spec),
        )
        .with_context(|| {
            format!(
                "Failed to mount {} on {}",
                spec.backing_root.display(),
                spec.target_path.display()
            )
        })?;
        Ok(Box::new(FuseHandle(session)))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        unmount(target, UnmountFlags::empty())
            .with_context(|| format!("Failed to unmount {}", target.display()))
    }
}

struct ChildHandle {
    child: Child,
    target: PathBuf,
}

impl MountHandle for ChildHandle {
    fn wait(mut self: Box<Self>) -> Result<()> {
        let status = self
            .child
            .wait()
            .with_context(|| format!("Failed to wait for mount of {}", self.target.display()))?;
        if !status.success() {
            bail!("Mount of {} exited with {status}", self.target.display());
        }
        Ok(())
    }
}

/// Serves each [`MountSpec`] from a child process running the `passthrough` command.
pub struct ProcessBackend {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl ProcessBackend {
    pub fn new(program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Re-executes the running binary.
    pub fn current_exe(leading_args: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate own executable")?;
        Ok(Self::new(program, leading_args))
    }

    fn command(&self, spec: &MountSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg("passthrough")
            .arg("--fs-tag")
            .arg(&spec.fs_tag);
        if spec.options.contains(&MountFlag::NonEmpty) {
            command.arg("--nonempty");
        }
        command
            .arg(&spec.backing_root)
            .arg(&spec.target_path)
            .stdin(Stdio::null());
        command
    }
}

impl MountBackend for ProcessBackend {
    fn attach(&self, spec: &MountSpec) -> Result<Box<dyn MountHandle>> {
        let child = self.command(spec).spawn().with_context(|| {
            format!("Failed to start mount process for {}", spec.target_path.display())
        })?;
        tracing::debug!(pid = child.id(), target_path = %spec.target_path.display(), "mount_process");
        Ok(Box::new(ChildHandle {
            child,
            target: spec.target_path.clone(),
        }))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        unmount(target, UnmountFlags::empty())
            .with_context(|| format!("Failed to unmount {}", target.display()))
    }
}
