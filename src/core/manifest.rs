// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::utils;

const MANIFEST_MODE: u32 = 0o644;

/// One exposed volume: its identifier and the host mount point behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Path")]
    pub path: String,
}

/// Replaces the manifest at `path` with `entries`.
pub fn write(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    let json = serde_json::to_vec(entries).context("Failed to serialize volume manifest")?;
    utils::replace_file(path, &json, MANIFEST_MODE)
        .with_context(|| format!("Failed to write manifest {}", path.display()))?;
    tracing::debug!(path = %path.display(), count = entries.len(), "manifest_written");
    Ok(())
}

pub fn read(path: &Path) -> Result<Vec<ManifestEntry>> {
    let content = fs::read(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_json::from_slice(&content).context("Failed to parse volume manifest")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uuid: &str, path: &str) -> ManifestEntry {
        ManifestEntry {
            uuid: uuid.to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn read_back_matches_written_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".fde_path_key");
        let mut entries = vec![
            entry("5a1c-77", "/data"),
            entry("0b2e-13", "/"),
            entry("9f00-aa", "/mnt/media"),
        ];
        write(&path, &entries).unwrap();

        let mut back = read(&path).unwrap();
        back.sort();
        entries.sort();
        assert_eq!(back, entries);
    }

    #[test]
    fn rewrite_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest");
        write(&path, &[entry("a", "/a"), entry("b", "/b")]).unwrap();
        write(&path, &[entry("c", "/c")]).unwrap();
        assert_eq!(read(&path).unwrap(), vec![entry("c", "/c")]);
    }

    #[test]
    fn wire_format_uses_capitalised_keys() {
        let json = serde_json::to_string(&[entry("u", "/p")]).unwrap();
        assert_eq!(json, r#"[{"UUID":"u","Path":"/p"}]"#);
    }
}
