// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rustix::mount::{UnmountFlags, unmount};

/// Writes `content` beside `path` and renames it into place, so readers see
/// either the old file or the new one.
pub fn replace_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut staged = path.as_os_str().to_owned();
    staged.push(format!(".{}.next", std::process::id()));
    let staged = PathBuf::from(staged);

    let written = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&staged)
            .with_context(|| format!("Failed to create {}", staged.display()))?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&staged, path)
            .with_context(|| format!("rename {} -> {}", staged.display(), path.display()))
    })();

    if written.is_err() {
        let _ = fs::remove_file(&staged);
    }
    written
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirState {
    Created,
    Present,
    /// The path existed but could not be stat'ed and was unmounted.
    Reclaimed,
}

/// Makes `path` usable as a mount point.
///
/// A missing directory is created with `mode`. A path that exists but cannot be
/// stat'ed (typically a dead FUSE endpoint reporting ENOTCONN) is unmounted.
pub fn ensure_mount_point(path: &Path, mode: u32) -> Result<DirState> {
    match fs::metadata(path) {
        Ok(_) => Ok(DirState::Present),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::DirBuilder::new()
                .mode(mode)
                .create(path)
                .with_context(|| format!("Failed to create mount point {}", path.display()))?;
            Ok(DirState::Created)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "mount_point_stale");
            unmount(path, UnmountFlags::empty())
                .with_context(|| format!("Failed to unmount stale {}", path.display()))?;
            Ok(DirState::Reclaimed)
        }
    }
}

pub fn set_umask(mask: u32) -> u32 {
    use rustix::fs::Mode;
    rustix::process::umask(Mode::from_raw_mode(mask)).as_raw_mode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_file_swaps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        replace_file(&path, b"one", 0o644).unwrap();
        replace_file(&path, b"two", 0o644).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn failed_replace_leaves_nothing_staged() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("child"), "x").unwrap();
        assert!(replace_file(&target, b"data", 0o644).is_err());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("occupied")]);
    }

    #[test]
    fn mount_point_created_then_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uuid-1");
        assert_eq!(ensure_mount_point(&path, 0o755).unwrap(), DirState::Created);
        assert_eq!(ensure_mount_point(&path, 0o755).unwrap(), DirState::Present);
        assert!(path.is_dir());
    }
}
