// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use procfs::process::MountInfo;

use crate::{
    conf::config::Config,
    core::manifest::{self, ManifestEntry},
    mount::MountSpec,
    utils,
};

const EXPOSURE_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub mount_point: String,
    pub mount_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub device_path: String,
    pub mount_point: String,
    pub mount_id: u64,
    pub uuid: String,
}

pub struct MountFilter<'a> {
    pub fs_type: &'a str,
    pub excluded: &'a [String],
}

impl<'a> MountFilter<'a> {
    pub fn from_config(config: &'a Config) -> Self {
        Self {
            fs_type: &config.fs_type,
            excluded: &config.excluded_mount_points,
        }
    }
}

/// Rewrites a relative device link such as `../../sda5` into `/dev/sda5`.
fn rewrite_device_link(target: &str, up: &str) -> String {
    match target.strip_prefix(up) {
        Some(rest) => format!("/dev{rest}"),
        None => target.to_string(),
    }
}

/// Follows a `/dev/mapper/*` link to the block device behind it.
pub fn resolve_mapper(device: &str) -> Result<String> {
    let target = fs::read_link(device)
        .with_context(|| format!("Failed to read mapper link {device}"))?;
    Ok(rewrite_device_link(&target.to_string_lossy(), ".."))
}

/// Decodes the `\NNN` octal escapes the kernel writes for blanks and backslashes.
pub fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(code) = bytes.get(i + 1..i + 4)
            && code.iter().all(|b| (b'0'..=b'7').contains(b))
        {
            out.push(
                code.iter()
                    .fold(0u8, |acc, b| acc.wrapping_mul(8).wrapping_add(b - b'0')),
            );
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses mountinfo rows, skipping the ones procfs rejects.
pub fn parse_table(text: &str) -> Vec<MountInfo> {
    text.lines()
        .filter_map(|line| match MountInfo::from_line(line) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(line, error = %e, "mountinfo_skip");
                None
            }
        })
        .collect()
}

/// Collects root mounts of supported block devices, keyed by device.
///
/// Bind mounts and later remounts of the same device lose to the record with
/// the lowest mount id.
pub fn select_mounts<I, R>(
    mounts: I,
    filter: &MountFilter<'_>,
    mut resolve: R,
) -> Result<HashMap<String, MountRecord>>
where
    I: IntoIterator<Item = MountInfo>,
    R: FnMut(&str) -> Result<String>,
{
    let mut by_device: HashMap<String, MountRecord> = HashMap::new();

    for info in mounts {
        if info.root != "/" || info.fs_type != filter.fs_type {
            continue;
        }
        let Some(device) = info.mount_source.as_deref() else {
            continue;
        };
        if device.contains("loop") {
            continue;
        }
        let mount_point = unescape_octal(&info.mount_point.to_string_lossy());
        if filter.excluded.iter().any(|e| *e == mount_point) {
            continue;
        }
        let Ok(mount_id) = u64::try_from(info.mnt_id) else {
            tracing::debug!(mnt_id = info.mnt_id, "mountinfo_bad_id");
            continue;
        };

        let device = if device.starts_with("/dev/mapper/") {
            resolve(device)?
        } else {
            device.to_string()
        };

        let candidate = MountRecord {
            mount_point,
            mount_id,
        };
        by_device
            .entry(device)
            .and_modify(|kept| {
                if candidate.mount_id < kept.mount_id {
                    *kept = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    Ok(by_device)
}

/// Pairs device-naming entries with the recorded mounts of their devices.
pub fn supplement_volumes(
    device_dir: &Path,
    by_device: &HashMap<String, MountRecord>,
) -> Result<Vec<Volume>> {
    let entries = fs::read_dir(device_dir)
        .with_context(|| format!("Failed to read device directory {}", device_dir.display()))?;

    let mut by_uuid: BTreeMap<String, Volume> = BTreeMap::new();
    for entry in entries {
        let entry = entry.context("Failed to read device directory entry")?;
        let uuid = entry.file_name().to_string_lossy().to_string();
        let target = match fs::read_link(entry.path()) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::error!(uuid = %uuid, error = %e, "read_volumes");
                return Err(e)
                    .with_context(|| format!("Failed to resolve device link {uuid}"));
            }
        };
        let device = rewrite_device_link(&target.to_string_lossy(), "../..");
        if let Some(record) = by_device.get(&device) {
            by_uuid.insert(
                uuid.clone(),
                Volume {
                    device_path: device,
                    mount_point: record.mount_point.clone(),
                    mount_id: record.mount_id,
                    uuid,
                },
            );
        }
    }

    Ok(by_uuid.into_values().collect())
}

pub fn discover(config: &Config) -> Result<Vec<Volume>> {
    let text = fs::read_to_string(&config.mountinfo_path).with_context(|| {
        format!(
            "Failed to read mount table {}",
            config.mountinfo_path.display()
        )
    })?;
    let by_device = select_mounts(
        parse_table(&text),
        &MountFilter::from_config(config),
        resolve_mapper,
    )?;
    tracing::info!(devices = by_device.len(), "mount_info_by_device");
    supplement_volumes(&config.device_dir, &by_device)
}

/// Prepares one exposure directory per volume and records the manifest.
pub fn expose(config: &Config, volumes: &[Volume]) -> Result<Vec<MountSpec>> {
    let previous = utils::set_umask(0);
    let result = expose_inner(config, volumes);
    utils::set_umask(previous);
    result
}

fn expose_inner(config: &Config, volumes: &[Volume]) -> Result<Vec<MountSpec>> {
    let root = &config.volumes_root;
    if !root.exists() {
        fs::DirBuilder::new()
            .mode(EXPOSURE_MODE)
            .create(root)
            .with_context(|| format!("Failed to create {}", root.display()))?;
    }

    let mut specs = Vec::with_capacity(volumes.len());
    let mut entries = Vec::with_capacity(volumes.len());
    for volume in volumes {
        let target: PathBuf = root.join(&volume.uuid);
        let state = utils::ensure_mount_point(&target, EXPOSURE_MODE)?;
        tracing::debug!(uuid = %volume.uuid, state = ?state, "exposure_dir");
        entries.push(ManifestEntry {
            uuid: volume.uuid.clone(),
            path: volume.mount_point.clone(),
        });
        specs.push(MountSpec::new(
            target,
            &volume.mount_point,
            &config.fuse_name,
        ));
    }

    if !entries.is_empty()
        && let Err(e) = manifest::write(&config.manifest_path(), &entries)
    {
        tracing::error!(error = %e, "write_fde_path");
    }

    Ok(specs)
}

/// Full resolution: mount table and device directory to mount specs.
pub fn resolve(config: &Config) -> Result<Vec<MountSpec>> {
    let volumes = discover(config)?;
    tracing::info!(volumes = ?volumes, "in_mount");
    expose(config, &volumes)
}
