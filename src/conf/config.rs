// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::defs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PersonalConfig {
    #[serde(default = "default_personal_tag")]
    pub fs_tag: String,
    #[serde(default = "default_true")]
    pub include_desktop: bool,
    #[serde(default = "default_container_media_dir")]
    pub container_media_dir: PathBuf,
    #[serde(default = "default_passthrough_probe")]
    pub passthrough_probe: String,
    #[serde(default = "default_gate_interval_ms")]
    pub gate_interval_ms: u64,
    #[serde(default = "default_container_gate_timeout_ms")]
    pub container_gate_timeout_ms: u64,
    #[serde(default = "default_dirs_gate_timeout_ms")]
    pub dirs_gate_timeout_ms: u64,
    #[serde(default = "default_applications_dir")]
    pub applications_dir: PathBuf,
    #[serde(default = "default_container_shell")]
    pub container_shell: Vec<String>,
    #[serde(default = "default_notify_command")]
    pub notify_command: Vec<String>,
    #[serde(default = "default_media_owner")]
    pub media_owner: u32,
    /// Where the container sees the media directory.
    #[serde(default = "default_container_media_prefix")]
    pub container_media_prefix: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_personal_tag() -> String {
    defs::PERSONAL_FS_TAG.to_string()
}

fn default_container_media_dir() -> PathBuf {
    PathBuf::from(defs::CONTAINER_MEDIA_DIR)
}

fn default_passthrough_probe() -> String {
    defs::PASSTHROUGH_PROBE.to_string()
}

fn default_gate_interval_ms() -> u64 {
    defs::GATE_INTERVAL_MS
}

fn default_container_gate_timeout_ms() -> u64 {
    defs::CONTAINER_GATE_TIMEOUT_MS
}

fn default_dirs_gate_timeout_ms() -> u64 {
    defs::DIRS_GATE_TIMEOUT_MS
}

fn default_applications_dir() -> PathBuf {
    PathBuf::from(defs::APPLICATIONS_DIR)
}

fn default_container_shell() -> Vec<String> {
    vec!["waydroid".to_string(), "shell".to_string()]
}

fn default_notify_command() -> Vec<String> {
    vec!["waydroid".to_string(), "notify".to_string()]
}

fn default_media_owner() -> u32 {
    defs::MEDIA_OWNER_ID
}

fn default_container_media_prefix() -> PathBuf {
    PathBuf::from(defs::CONTAINER_MEDIA_PREFIX)
}

impl Default for PersonalConfig {
    fn default() -> Self {
        Self {
            fs_tag: default_personal_tag(),
            include_desktop: true,
            container_media_dir: default_container_media_dir(),
            passthrough_probe: default_passthrough_probe(),
            gate_interval_ms: default_gate_interval_ms(),
            container_gate_timeout_ms: default_container_gate_timeout_ms(),
            dirs_gate_timeout_ms: default_dirs_gate_timeout_ms(),
            applications_dir: default_applications_dir(),
            container_shell: default_container_shell(),
            notify_command: default_notify_command(),
            media_owner: default_media_owner(),
            container_media_prefix: default_container_media_prefix(),
        }
    }
}

impl PersonalConfig {
    pub fn gate_interval(&self) -> Duration {
        Duration::from_millis(self.gate_interval_ms)
    }

    pub fn container_gate_timeout(&self) -> Duration {
        Duration::from_millis(self.container_gate_timeout_ms)
    }

    pub fn dirs_gate_timeout(&self) -> Duration {
        Duration::from_millis(self.dirs_gate_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_volumes_root")]
    pub volumes_root: PathBuf,
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    #[serde(default = "default_mountinfo_path")]
    pub mountinfo_path: PathBuf,
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
    #[serde(default = "default_excluded_mount_points")]
    pub excluded_mount_points: Vec<String>,
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// Host directory exposed to the container; derived from the home
    /// directory when unset.
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    #[serde(default)]
    pub target: Option<PathBuf>,
    #[serde(default = "default_bridge_marker")]
    pub bridge_marker: String,
    #[serde(default = "default_owner_reference")]
    pub owner_reference: String,
    #[serde(default = "default_fuse_name")]
    pub fuse_name: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub personal: PersonalConfig,
}

fn default_volumes_root() -> PathBuf {
    PathBuf::from(defs::VOLUMES_ROOT)
}

fn default_manifest_name() -> String {
    defs::MANIFEST_FILE_NAME.to_string()
}

fn default_mountinfo_path() -> PathBuf {
    PathBuf::from(defs::MOUNTINFO_FILE)
}

fn default_device_dir() -> PathBuf {
    PathBuf::from(defs::DEVICE_NAMING_DIR)
}

fn default_fs_type() -> String {
    defs::SUPPORTED_FS_TYPE.to_string()
}

fn default_excluded_mount_points() -> Vec<String> {
    vec!["/boot".to_string()]
}

fn default_stagger_ms() -> u64 {
    defs::STAGGER_MS
}

fn default_bridge_marker() -> String {
    defs::BRIDGE_MARKER.to_string()
}

fn default_owner_reference() -> String {
    defs::OWNER_REFERENCE.to_string()
}

fn default_fuse_name() -> String {
    defs::FUSE_NAME.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            volumes_root: default_volumes_root(),
            manifest_name: default_manifest_name(),
            mountinfo_path: default_mountinfo_path(),
            device_dir: default_device_dir(),
            fs_type: default_fs_type(),
            excluded_mount_points: default_excluded_mount_points(),
            stagger_ms: default_stagger_ms(),
            data_root: None,
            target: None,
            bridge_marker: default_bridge_marker(),
            owner_reference: default_owner_reference(),
            fuse_name: default_fuse_name(),
            log_file: None,
            verbose: false,
            personal: PersonalConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("failed to read config file")?;

        let config: Config = toml::from_str(&content).context("failed to parse config file")?;

        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::from_file(defs::CONFIG_FILE)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }

        fs::write(path.as_ref(), content).context("failed to write config file")?;

        Ok(())
    }

    pub fn merge_with_cli(
        &mut self,
        data_root: Option<PathBuf>,
        target: Option<PathBuf>,
        verbose: bool,
    ) {
        if let Some(root) = data_root {
            self.data_root = Some(root);
        }

        if let Some(target) = target {
            self.target = Some(target);
        }

        if verbose {
            self.verbose = true;
        }
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.volumes_root.join(&self.manifest_name)
    }

    /// Name of the aggregation root when listed from "/".
    pub fn volumes_dir_name(&self) -> String {
        self.volumes_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| defs::VOLUMES_DIR_NAME.to_string())
    }
}
