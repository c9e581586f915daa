// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub const CONFIG_FILE: &str = "/etc/bridgefs/config.toml";

// Aggregation root: every exposed volume appears as <VOLUMES_ROOT>/<uuid>
pub const VOLUMES_ROOT: &str = "/volumes";
// Name of the aggregation root as seen from a filesystem rooted at "/"
pub const VOLUMES_DIR_NAME: &str = "volumes";
pub const MANIFEST_FILE_NAME: &str = ".fde_path_key";

pub const MOUNTINFO_FILE: &str = "/proc/self/mountinfo";
pub const DEVICE_NAMING_DIR: &str = "/dev/disk/by-uuid";
pub const SUPPORTED_FS_TYPE: &str = "ext4";

pub const FUSE_NAME: &str = "bridgefs";
pub const PERSONAL_FS_TAG: &str = "bridgefs_personal";

// Relative to the invoking user's home
pub const BRIDGE_MARKER: &str = ".local/share/openfde";
pub const CONTAINER_MEDIA_DIR: &str = "media/0";
pub const DATA_TARGET_NAME: &str = "openfde";
pub const CONTAINER_MEDIA_PREFIX: &str = "/sdcard";

// Entry whose ownership new top-level entries inherit
pub const OWNER_REFERENCE: &str = "Ringtones";

// media_rw inside the container
pub const MEDIA_OWNER_ID: u32 = 1023;

pub const PASSTHROUGH_PROBE: &str = "/mnt/pass_through";
pub const APPLICATIONS_DIR: &str = "/usr/share/applications";
pub const DESKTOP_FILE_SUFFIX: &str = ".desktop";

pub const STAGGER_MS: u64 = 1000;
pub const GATE_INTERVAL_MS: u64 = 1000;
pub const CONTAINER_GATE_TIMEOUT_MS: u64 = 10_000;
pub const DIRS_GATE_TIMEOUT_MS: u64 = 5_000;

// "No handle, resolve by path"
pub const NO_HANDLE: u64 = u64::MAX;
