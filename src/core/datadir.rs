// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    os::unix::fs::{DirBuilderExt, chown},
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::{
    conf::config::Config,
    defs,
    fs::access::Identity,
    mount::{MountFlag, MountSpec},
    utils::{self, DirState},
};

const DATA_DIR_MODE: u32 = 0o751;

/// Where the host data tree lives and where it is exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    /// Existing directory the tree hangs off (the home directory).
    pub anchor: PathBuf,
    /// Host-owned part below the anchor, e.g. `.local/share/openfde`.
    pub bridge: PathBuf,
    /// Container-owned part below the bridge, e.g. `media/0`.
    pub media: PathBuf,
    pub target: PathBuf,
}

pub fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .context("Failed to determine home directory: HOME is not set")
}

impl DataLayout {
    pub fn from_config(config: &Config) -> Result<Self> {
        let target = match &config.target {
            Some(target) => target.clone(),
            None => home_dir()?.join(defs::DATA_TARGET_NAME),
        };
        Ok(match &config.data_root {
            Some(root) => Self {
                anchor: root.clone(),
                bridge: PathBuf::new(),
                media: PathBuf::new(),
                target,
            },
            None => Self {
                anchor: home_dir()?,
                bridge: PathBuf::from(&config.bridge_marker),
                media: config.personal.container_media_dir.clone(),
                target,
            },
        })
    }

    pub fn bridge_root(&self) -> PathBuf {
        self.anchor.join(&self.bridge)
    }

    pub fn data_root(&self) -> PathBuf {
        self.bridge_root().join(&self.media)
    }
}

/// Chowns each directory from `start` down along `relative`, excluding `start`.
fn chown_chain(start: &Path, relative: &Path, owner: Identity) -> Result<()> {
    let mut current = start.to_path_buf();
    for component in relative.components() {
        if let Component::Normal(name) = component {
            current.push(name);
            chown(&current, Some(owner.uid), Some(owner.gid))
                .with_context(|| format!("Failed to chown {}", current.display()))?;
        }
    }
    Ok(())
}

/// Creates the data tree and the exposure target, returning the data-root spec.
pub fn prepare(
    layout: &DataLayout,
    user: Identity,
    media_owner: Identity,
    fs_tag: &str,
) -> Result<MountSpec> {
    let data_root = layout.data_root();
    if !data_root.exists() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DATA_DIR_MODE)
            .create(&data_root)
            .with_context(|| format!("Failed to create data root {}", data_root.display()))?;
        chown_chain(&layout.anchor, &layout.bridge, user)?;
        chown_chain(&layout.bridge_root(), &layout.media, media_owner)?;
        tracing::info!(path = %data_root.display(), "data_root_created");
    }

    match utils::ensure_mount_point(&layout.target, DATA_DIR_MODE)? {
        DirState::Created => {
            chown(&layout.target, Some(user.uid), Some(user.gid))
                .with_context(|| format!("Failed to chown {}", layout.target.display()))?;
        }
        DirState::Reclaimed => {
            tracing::info!(path = %layout.target.display(), "data_target_reclaimed")
        }
        DirState::Present => {}
    }

    Ok(MountSpec::new(&layout.target, data_root, fs_tag).with_flag(MountFlag::NonEmpty))
}

/// Identity of the user who invoked us, regardless of effective uid.
pub fn invoking_user() -> Identity {
    Identity::new(
        rustix::process::getuid().as_raw(),
        rustix::process::getgid().as_raw(),
    )
}
