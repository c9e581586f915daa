// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::{OsStr, OsString},
    fs,
    io,
    os::{
        fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
        unix::ffi::{OsStrExt, OsStringExt},
    },
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use nix::unistd::{Gid, Uid, setfsgid, setfsuid};
use rustix::{
    fs::{
        Access, AtFlags, CWD, FileType, Mode, OFlags, Stat, StatVfs, Timespec, Timestamps,
        UTIME_NOW, UTIME_OMIT,
    },
    io::Errno,
};

use super::{
    access::{self, Identity},
    namespace::NamespaceClassifier,
};
use crate::defs;

pub type OpResult<T> = Result<T, Errno>;

pub fn io_errno(e: io::Error) -> Errno {
    Errno::from_io_error(&e).unwrap_or(Errno::IO)
}

/// Who issued a request, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl RequestContext {
    pub fn identity(&self) -> Identity {
        Identity::new(self.uid, self.gid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Omit,
    Now,
    At(SystemTime),
}

impl SetTime {
    fn timespec(self) -> Timespec {
        match self {
            SetTime::Omit => Timespec {
                tv_sec: 0,
                tv_nsec: UTIME_OMIT as _,
            },
            SetTime::Now => Timespec {
                tv_sec: 0,
                tv_nsec: UTIME_NOW as _,
            },
            SetTime::At(time) => {
                let (secs, nanos) = match time.duration_since(UNIX_EPOCH) {
                    Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
                    Err(e) => {
                        let d = e.duration();
                        let mut secs = -(d.as_secs() as i64);
                        let mut nanos = d.subsec_nanos() as i64;
                        if nanos > 0 {
                            secs -= 1;
                            nanos = 1_000_000_000 - nanos;
                        }
                        (secs, nanos)
                    }
                };
                Timespec {
                    tv_sec: secs as _,
                    tv_nsec: nanos as _,
                }
            }
        }
    }
}

/// Path-based filesystem operation set.
///
/// Paths are virtual: absolute, rooted at the mount point. `fh` values are the
/// handles returned from `open`/`create`/`opendir`; `defs::NO_HANDLE` means
/// "resolve by path".
pub trait PathFilesystem: Send + 'static {
    fn getattr(&self, ctx: &RequestContext, path: &Path, fh: u64) -> OpResult<Stat>;
    fn access(&self, ctx: &RequestContext, path: &Path, mask: i32) -> OpResult<()>;
    fn statfs(&self, ctx: &RequestContext, path: &Path) -> OpResult<StatVfs>;
    fn mknod(&self, ctx: &RequestContext, path: &Path, mode: u32, rdev: u64) -> OpResult<()>;
    fn mkdir(&self, ctx: &RequestContext, path: &Path, mode: u32) -> OpResult<()>;
    fn unlink(&self, ctx: &RequestContext, path: &Path) -> OpResult<()>;
    fn rmdir(&self, ctx: &RequestContext, path: &Path) -> OpResult<()>;
    fn link(&self, ctx: &RequestContext, old: &Path, new: &Path) -> OpResult<()>;
    fn symlink(&self, ctx: &RequestContext, target: &Path, new: &Path) -> OpResult<()>;
    fn readlink(&self, ctx: &RequestContext, path: &Path) -> OpResult<OsString>;
    fn rename(&self, ctx: &RequestContext, old: &Path, new: &Path) -> OpResult<()>;
    fn chmod(&self, ctx: &RequestContext, path: &Path, mode: u32) -> OpResult<()>;
    fn chown(
        &self,
        ctx: &RequestContext,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> OpResult<()>;
    fn utimens(
        &self,
        ctx: &RequestContext,
        path: &Path,
        atime: SetTime,
        mtime: SetTime,
    ) -> OpResult<()>;
    fn truncate(&self, ctx: &RequestContext, path: &Path, size: u64, fh: u64) -> OpResult<()>;
    fn create(&self, ctx: &RequestContext, path: &Path, flags: i32, mode: u32) -> OpResult<u64>;
    fn open(&self, ctx: &RequestContext, path: &Path, flags: i32) -> OpResult<u64>;
    fn read(
        &self,
        ctx: &RequestContext,
        path: &Path,
        buf: &mut [u8],
        offset: u64,
        fh: u64,
    ) -> OpResult<usize>;
    fn write(
        &self,
        ctx: &RequestContext,
        path: &Path,
        data: &[u8],
        offset: u64,
        fh: u64,
    ) -> OpResult<usize>;
    fn release(&self, ctx: &RequestContext, path: &Path, fh: u64) -> OpResult<()>;
    fn fsync(&self, ctx: &RequestContext, path: &Path, datasync: bool, fh: u64) -> OpResult<()>;
    fn opendir(&self, ctx: &RequestContext, path: &Path) -> OpResult<u64>;
    fn readdir(&self, ctx: &RequestContext, path: &Path, fh: u64) -> OpResult<Vec<OsString>>;
    fn releasedir(&self, ctx: &RequestContext, path: &Path, fh: u64) -> OpResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct PassthroughOptions {
    /// Relative marker locating the protected bridging tree, e.g.
    /// `.local/share/openfde`. Its parent prefix in the backing root is the
    /// anchor whose owner governs access.
    pub bridge_marker: Option<PathBuf>,
    /// Top-level entry hidden when the backing root is `/`.
    pub hidden_root_entry: Option<OsString>,
    /// Entry under the backing root whose owner is given to new top-level
    /// entries in the protected tree.
    pub owner_reference: Option<OsString>,
}

/// Forwards every operation to a backing directory, enforcing the bridge
/// access policy on top of the kernel's checks.
pub struct PassthroughFs {
    root: PathBuf,
    anchor: Option<PathBuf>,
    hidden_root_entry: Option<OsString>,
    owner_reference: Option<OsString>,
    namespaces: NamespaceClassifier,
}

/// `name` equals `marker`, optionally followed by a numeric version (`openfde14`).
fn matches_versioned(name: &OsStr, marker: &OsStr) -> bool {
    name.as_bytes()
        .strip_prefix(marker.as_bytes())
        .is_some_and(|version| version.iter().all(u8::is_ascii_digit))
}

/// Anchor of the protected tree for `root`: the path prefix preceding `marker`.
pub fn protected_anchor(root: &Path, marker: &Path) -> Option<PathBuf> {
    let root_components: Vec<Component<'_>> = root.components().collect();
    let marker_components: Vec<Component<'_>> = marker.components().collect();
    let last = marker_components.len().checked_sub(1)?;
    if marker_components.len() > root_components.len() {
        return None;
    }
    root_components
        .windows(marker_components.len())
        .position(|w| {
            w.iter()
                .zip(&marker_components)
                .enumerate()
                .all(|(i, (a, b))| match (a, b) {
                    (Component::Normal(a), Component::Normal(b)) if i == last => {
                        matches_versioned(a, b)
                    }
                    _ => a == b,
                })
        })
        .map(|start| root_components[..start].iter().collect())
}

struct FsIdentityGuard {
    uid: Uid,
    gid: Gid,
}

impl FsIdentityGuard {
    /// Creates entries as the caller for the rest of the scope.
    fn assume(ctx: &RequestContext) -> Self {
        let gid = setfsgid(Gid::from_raw(ctx.gid));
        let uid = setfsuid(Uid::from_raw(ctx.uid));
        Self { uid, gid }
    }
}

impl Drop for FsIdentityGuard {
    fn drop(&mut self) {
        setfsuid(self.uid);
        setfsgid(self.gid);
    }
}

fn borrow_handle<'a>(fh: u64) -> OpResult<BorrowedFd<'a>> {
    if fh == defs::NO_HANDLE || fh > RawFd::MAX as u64 {
        return Err(Errno::BADF);
    }
    // SAFETY: handles originate from `into_raw_fd` in open/create/opendir and
    // stay open until release/releasedir.
    Ok(unsafe { BorrowedFd::borrow_raw(fh as RawFd) })
}

fn close_handle(fh: u64) -> OpResult<()> {
    if fh == defs::NO_HANDLE || fh > RawFd::MAX as u64 {
        return Err(Errno::BADF);
    }
    // SAFETY: ownership of the descriptor returns here exactly once.
    drop(unsafe { OwnedFd::from_raw_fd(fh as RawFd) });
    Ok(())
}

impl PassthroughFs {
    pub fn new(root: impl Into<PathBuf>, options: PassthroughOptions) -> Self {
        Self::with_classifier(root, options, NamespaceClassifier::new())
    }

    pub fn with_classifier(
        root: impl Into<PathBuf>,
        options: PassthroughOptions,
        namespaces: NamespaceClassifier,
    ) -> Self {
        let root = root.into();
        let anchor = options
            .bridge_marker
            .as_deref()
            .and_then(|marker| protected_anchor(&root, marker));
        let hidden_root_entry = if root == Path::new("/") {
            options.hidden_root_entry
        } else {
            None
        };
        Self {
            root,
            anchor,
            hidden_root_entry,
            owner_reference: options.owner_reference,
            namespaces,
        }
    }

    #[cfg(test)]
    fn anchor(&self) -> Option<&Path> {
        self.anchor.as_deref()
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    fn is_host(&self, ctx: &RequestContext) -> bool {
        self.namespaces.is_host_namespace(ctx.pid)
    }

    fn is_hidden(&self, path: &Path) -> bool {
        let Some(hidden) = &self.hidden_root_entry else {
            return false;
        };
        path.components()
            .find_map(|c| match c {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .is_some_and(|first| first == hidden.as_os_str())
    }

    fn owner_of(path: &Path) -> OpResult<(Identity, u32)> {
        let st = rustix::fs::stat(path)?;
        Ok((Identity::new(st.st_uid, st.st_gid), st.st_mode as u32))
    }

    fn check_read(&self, ctx: &RequestContext, target: &Path, tag: &str) -> OpResult<()> {
        let (owner, mode) = Self::owner_of(target)?;
        if access::can_read(ctx.identity(), owner, mode) {
            return Ok(());
        }
        tracing::info!(
            event = tag,
            uid = ctx.uid,
            gid = ctx.gid,
            file_uid = owner.uid,
            file_gid = owner.gid,
            path = %target.display(),
            "read_denied"
        );
        Err(Errno::ACCESS)
    }

    fn check_anchor_write(&self, ctx: &RequestContext, anchor: &Path) -> OpResult<()> {
        let (owner, mode) = Self::owner_of(anchor)?;
        if access::can_write(ctx.identity(), owner, mode) {
            return Ok(());
        }
        tracing::warn!(
            uid = ctx.uid,
            gid = ctx.gid,
            file_uid = owner.uid,
            file_gid = owner.gid,
            path = %anchor.display(),
            "judge_w_permission"
        );
        Err(Errno::ACCESS)
    }

    /// Read gate shared by access/open/opendir for container-issued requests.
    fn gate_foreign_read(
        &self,
        ctx: &RequestContext,
        resolved: &Path,
        own_check: bool,
        tag: &str,
    ) -> OpResult<()> {
        if self.is_host(ctx) {
            return Ok(());
        }
        match &self.anchor {
            Some(anchor) => self.check_read(ctx, anchor, tag),
            None if own_check => self.check_read(ctx, resolved, tag),
            None => Ok(()),
        }
    }

    /// Owner a freshly created entry at `resolved` should carry.
    fn inherited_owner(&self, resolved: &Path) -> OpResult<Identity> {
        let parent = resolved.parent().unwrap_or(&self.root);
        let reference = match &self.owner_reference {
            Some(name) if parent == self.root => {
                let candidate = self.root.join(name);
                if candidate.exists() {
                    candidate
                } else {
                    parent.to_path_buf()
                }
            }
            _ => parent.to_path_buf(),
        };
        Self::owner_of(&reference).map(|(owner, _)| owner)
    }

    /// Runs `op` as a creation inside the protected tree when the request is
    /// host-issued, otherwise under the caller's filesystem identity.
    fn create_entry<T>(
        &self,
        ctx: &RequestContext,
        resolved: &Path,
        op: impl FnOnce() -> OpResult<T>,
    ) -> OpResult<T> {
        match &self.anchor {
            Some(anchor) if self.is_host(ctx) => {
                self.check_anchor_write(ctx, anchor)?;
                let owner = self.inherited_owner(resolved)?;
                let value = op()?;
                if let Err(e) =
                    std::os::unix::fs::lchown(resolved, Some(owner.uid), Some(owner.gid))
                {
                    tracing::warn!(path = %resolved.display(), error = %e, "chown_created_entry");
                }
                Ok(value)
            }
            _ => {
                let _identity = FsIdentityGuard::assume(ctx);
                op()
            }
        }
    }

    fn open_raw(path: &Path, flags: i32, mode: u32) -> OpResult<u64> {
        let fd = rustix::fs::open(
            path,
            OFlags::from_bits_retain(flags as _),
            Mode::from_raw_mode(mode),
        )?;
        Ok(fd.into_raw_fd() as u64)
    }
}

impl PathFilesystem for PassthroughFs {
    fn getattr(&self, _ctx: &RequestContext, path: &Path, fh: u64) -> OpResult<Stat> {
        if fh == defs::NO_HANDLE {
            rustix::fs::lstat(self.resolve(path))
        } else {
            rustix::fs::fstat(borrow_handle(fh)?)
        }
    }

    fn access(&self, ctx: &RequestContext, path: &Path, mask: i32) -> OpResult<()> {
        let resolved = self.resolve(path);
        self.gate_foreign_read(ctx, &resolved, false, "access")?;
        rustix::fs::access(&resolved, Access::from_bits_retain(mask as _))
    }

    fn statfs(&self, _ctx: &RequestContext, path: &Path) -> OpResult<StatVfs> {
        rustix::fs::statvfs(self.resolve(path))
    }

    fn mknod(&self, ctx: &RequestContext, path: &Path, mode: u32, rdev: u64) -> OpResult<()> {
        let resolved = self.resolve(path);
        let _identity = FsIdentityGuard::assume(ctx);
        rustix::fs::mknodat(
            CWD,
            &resolved,
            FileType::from_raw_mode(mode as _),
            Mode::from_raw_mode(mode as _),
            rdev as _,
        )
    }

    fn mkdir(&self, ctx: &RequestContext, path: &Path, mode: u32) -> OpResult<()> {
        let resolved = self.resolve(path);
        self.create_entry(ctx, &resolved, || {
            rustix::fs::mkdir(&resolved, Mode::from_raw_mode(mode as _))
        })
    }

    fn unlink(&self, _ctx: &RequestContext, path: &Path) -> OpResult<()> {
        rustix::fs::unlink(self.resolve(path))
    }

    fn rmdir(&self, _ctx: &RequestContext, path: &Path) -> OpResult<()> {
        rustix::fs::rmdir(self.resolve(path))
    }

    fn link(&self, ctx: &RequestContext, old: &Path, new: &Path) -> OpResult<()> {
        let _identity = FsIdentityGuard::assume(ctx);
        rustix::fs::link(self.resolve(old), self.resolve(new))
    }

    fn symlink(&self, ctx: &RequestContext, target: &Path, new: &Path) -> OpResult<()> {
        let _identity = FsIdentityGuard::assume(ctx);
        rustix::fs::symlink(target, self.resolve(new))
    }

    fn readlink(&self, _ctx: &RequestContext, path: &Path) -> OpResult<OsString> {
        let target = rustix::fs::readlink(self.resolve(path), Vec::new())?;
        Ok(OsString::from_vec(target.into_bytes()))
    }

    fn rename(&self, ctx: &RequestContext, old: &Path, new: &Path) -> OpResult<()> {
        let _identity = FsIdentityGuard::assume(ctx);
        rustix::fs::rename(self.resolve(old), self.resolve(new))
    }

    fn chmod(&self, _ctx: &RequestContext, path: &Path, mode: u32) -> OpResult<()> {
        rustix::fs::chmod(self.resolve(path), Mode::from_raw_mode(mode as _))
    }

    fn chown(
        &self,
        _ctx: &RequestContext,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> OpResult<()> {
        std::os::unix::fs::lchown(self.resolve(path), uid, gid).map_err(io_errno)
    }

    fn utimens(
        &self,
        _ctx: &RequestContext,
        path: &Path,
        atime: SetTime,
        mtime: SetTime,
    ) -> OpResult<()> {
        let times = Timestamps {
            last_access: atime.timespec(),
            last_modification: mtime.timespec(),
        };
        rustix::fs::utimensat(CWD, self.resolve(path), &times, AtFlags::empty())
    }

    fn truncate(&self, _ctx: &RequestContext, path: &Path, size: u64, fh: u64) -> OpResult<()> {
        if fh == defs::NO_HANDLE {
            let fd = rustix::fs::open(
                self.resolve(path),
                OFlags::WRONLY | OFlags::CLOEXEC,
                Mode::empty(),
            )?;
            rustix::fs::ftruncate(&fd, size)
        } else {
            rustix::fs::ftruncate(borrow_handle(fh)?, size)
        }
    }

    fn create(&self, ctx: &RequestContext, path: &Path, flags: i32, mode: u32) -> OpResult<u64> {
        let resolved = self.resolve(path);
        self.create_entry(ctx, &resolved, || {
            Self::open_raw(&resolved, flags | libc::O_CREAT, mode)
        })
    }

    fn open(&self, ctx: &RequestContext, path: &Path, flags: i32) -> OpResult<u64> {
        let resolved = self.resolve(path);
        self.gate_foreign_read(ctx, &resolved, true, "open")?;
        Self::open_raw(&resolved, flags, 0)
    }

    fn read(
        &self,
        _ctx: &RequestContext,
        _path: &Path,
        buf: &mut [u8],
        offset: u64,
        fh: u64,
    ) -> OpResult<usize> {
        rustix::io::pread(borrow_handle(fh)?, buf, offset)
    }

    fn write(
        &self,
        _ctx: &RequestContext,
        _path: &Path,
        data: &[u8],
        offset: u64,
        fh: u64,
    ) -> OpResult<usize> {
        rustix::io::pwrite(borrow_handle(fh)?, data, offset)
    }

    fn release(&self, _ctx: &RequestContext, _path: &Path, fh: u64) -> OpResult<()> {
        close_handle(fh)
    }

    fn fsync(&self, _ctx: &RequestContext, _path: &Path, datasync: bool, fh: u64) -> OpResult<()> {
        let fd = borrow_handle(fh)?;
        if datasync {
            rustix::fs::fdatasync(fd)
        } else {
            rustix::fs::fsync(fd)
        }
    }

    fn opendir(&self, ctx: &RequestContext, path: &Path) -> OpResult<u64> {
        let resolved = self.resolve(path);
        self.gate_foreign_read(ctx, &resolved, true, "open_dir")?;
        if self.is_hidden(path) {
            return Err(Errno::NOENT);
        }
        Self::open_raw(&resolved, libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC, 0)
    }

    fn readdir(&self, _ctx: &RequestContext, path: &Path, _fh: u64) -> OpResult<Vec<OsString>> {
        let resolved = self.resolve(path);
        let at_top = resolved == self.root;
        let mut names = vec![OsString::from("."), OsString::from("..")];
        for entry in fs::read_dir(&resolved).map_err(io_errno)? {
            let name = entry.map_err(io_errno)?.file_name();
            if at_top && self.hidden_root_entry.as_ref() == Some(&name) {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    fn releasedir(&self, _ctx: &RequestContext, _path: &Path, fh: u64) -> OpResult<()> {
        close_handle(fh)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use super::*;

    fn host_ctx() -> RequestContext {
        RequestContext {
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            pid: std::process::id(),
        }
    }

    fn foreign_ctx(uid: u32, gid: u32) -> RequestContext {
        // no such pid: classified as container
        RequestContext {
            uid,
            gid,
            pid: u32::MAX,
        }
    }

    fn plain(root: &Path) -> PassthroughFs {
        PassthroughFs::new(root, PassthroughOptions::default())
    }

    #[test]
    fn anchor_is_prefix_before_marker() {
        let root = Path::new("/home/alice/.local/share/openfde/media/0");
        assert_eq!(
            protected_anchor(root, Path::new(".local/share/openfde")),
            Some(PathBuf::from("/home/alice"))
        );
        let versioned = Path::new("/home/alice/.local/share/openfde14/media/0");
        assert_eq!(
            protected_anchor(versioned, Path::new(".local/share/openfde")),
            Some(PathBuf::from("/home/alice"))
        );
        assert_eq!(
            protected_anchor(Path::new("/data"), Path::new(".local/share/openfde")),
            None
        );
    }

    #[test]
    fn anchor_needs_whole_components() {
        let marker = Path::new(".local/share/openfde");
        for root in [
            "/home/alice/.localX/share/openfde/media/0",
            "/home/alice/.local/shareY/openfde/media/0",
            "/home/alice/.local/share/openfdeZ/media/0",
            "/home/alice/.local/share/openfde1b/media/0",
        ] {
            assert_eq!(protected_anchor(Path::new(root), marker), None, "{root}");
        }
        assert_eq!(
            protected_anchor(Path::new("/home/bob/.local/share/openfde/media/0"), marker),
            Some(PathBuf::from("/home/bob"))
        );
    }

    #[test]
    fn file_roundtrip_through_handles() {
        let dir = tempfile::tempdir().unwrap();
        let fs = plain(dir.path());
        let ctx = host_ctx();
        let path = Path::new("/note.txt");

        let fh = fs
            .create(&ctx, path, libc::O_RDWR | libc::O_CLOEXEC, 0o644)
            .unwrap();
        assert_eq!(fs.write(&ctx, path, b"hello bridge", 0, fh).unwrap(), 12);
        fs.fsync(&ctx, path, false, fh).unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(fs.read(&ctx, path, &mut buf, 6, fh).unwrap(), 6);
        assert_eq!(&buf, b"bridge");

        let by_handle = fs.getattr(&ctx, path, fh).unwrap();
        let by_path = fs.getattr(&ctx, path, defs::NO_HANDLE).unwrap();
        assert_eq!(by_handle.st_ino, by_path.st_ino);
        assert_eq!(by_path.st_size, 12);

        fs.truncate(&ctx, path, 5, defs::NO_HANDLE).unwrap();
        fs.release(&ctx, path, fh).unwrap();
        assert_eq!(fs::read(dir.path().join("note.txt")).unwrap(), b"hello");
    }

    #[test]
    fn bad_handles_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = plain(dir.path());
        let ctx = host_ctx();
        let mut buf = [0u8; 1];
        assert_eq!(
            fs.read(&ctx, Path::new("/x"), &mut buf, 0, defs::NO_HANDLE),
            Err(Errno::BADF)
        );
        assert_eq!(
            fs.release(&ctx, Path::new("/x"), defs::NO_HANDLE),
            Err(Errno::BADF)
        );
    }

    #[test]
    fn errors_map_to_errno() {
        let dir = tempfile::tempdir().unwrap();
        let fs = plain(dir.path());
        let ctx = host_ctx();
        assert_eq!(
            fs.getattr(&ctx, Path::new("/missing"), defs::NO_HANDLE)
                .map(|_| ()),
            Err(Errno::NOENT)
        );
        assert_eq!(fs.rmdir(&ctx, Path::new("/missing")), Err(Errno::NOENT));
        fs.mkdir(&ctx, Path::new("/d"), 0o755).unwrap();
        assert_eq!(fs.mkdir(&ctx, Path::new("/d"), 0o755), Err(Errno::EXIST));
    }

    #[test]
    fn namespace_operations() {
        let dir = tempfile::tempdir().unwrap();
        let fs = plain(dir.path());
        let ctx = host_ctx();

        fs.mkdir(&ctx, Path::new("/a"), 0o755).unwrap();
        let fh = fs
            .create(&ctx, Path::new("/a/f"), libc::O_WRONLY | libc::O_CLOEXEC, 0o600)
            .unwrap();
        fs.release(&ctx, Path::new("/a/f"), fh).unwrap();

        fs.rename(&ctx, Path::new("/a/f"), Path::new("/a/g")).unwrap();
        fs.link(&ctx, Path::new("/a/g"), Path::new("/a/h")).unwrap();
        fs.symlink(&ctx, Path::new("g"), Path::new("/a/s")).unwrap();
        assert_eq!(
            fs.readlink(&ctx, Path::new("/a/s")).unwrap(),
            OsString::from("g")
        );

        fs.chmod(&ctx, Path::new("/a/g"), 0o640).unwrap();
        let mode = fs::metadata(dir.path().join("a/g")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        let stamp = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        fs.utimens(&ctx, Path::new("/a/g"), SetTime::Omit, SetTime::At(stamp))
            .unwrap();
        assert_eq!(fs::metadata(dir.path().join("a/g")).unwrap().mtime(), 1_000_000);

        let mut names = fs.readdir(&ctx, Path::new("/a"), defs::NO_HANDLE).unwrap();
        names.sort();
        assert_eq!(names, vec![".", "..", "g", "h", "s"]);

        fs.unlink(&ctx, Path::new("/a/h")).unwrap();
        fs.unlink(&ctx, Path::new("/a/g")).unwrap();
        fs.unlink(&ctx, Path::new("/a/s")).unwrap();
        fs.rmdir(&ctx, Path::new("/a")).unwrap();
        assert!(fs.statfs(&ctx, Path::new("/")).is_ok());
    }

    #[test]
    fn hidden_entry_only_applies_to_slash_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("volumes")).unwrap();
        let options = PassthroughOptions {
            hidden_root_entry: Some(OsString::from("volumes")),
            ..Default::default()
        };
        let fs = PassthroughFs::new(dir.path(), options.clone());
        let ctx = host_ctx();
        let names = fs.readdir(&ctx, Path::new("/"), defs::NO_HANDLE).unwrap();
        assert!(names.contains(&OsString::from("volumes")));

        let slash = PassthroughFs::new("/", options);
        assert!(slash.is_hidden(Path::new("/volumes")));
        assert!(slash.is_hidden(Path::new("/volumes/abc")));
        assert!(!slash.is_hidden(Path::new("/home/volumes")));
        assert_eq!(slash.opendir(&ctx, Path::new("/volumes")), Err(Errno::NOENT));
    }

    #[test]
    fn slash_root_listing_omits_hidden_entry() {
        if !Path::new("/tmp").is_dir() {
            return;
        }
        let ctx = host_ctx();
        let options = PassthroughOptions {
            hidden_root_entry: Some(OsString::from("tmp")),
            ..Default::default()
        };
        let hiding = PassthroughFs::new("/", options);
        let names = hiding.readdir(&ctx, Path::new("/"), defs::NO_HANDLE).unwrap();
        assert!(!names.contains(&OsString::from("tmp")));
        assert!(names.contains(&OsString::from(".")));

        let unfiltered = plain(Path::new("/"))
            .readdir(&ctx, Path::new("/"), defs::NO_HANDLE)
            .unwrap();
        assert!(unfiltered.contains(&OsString::from("tmp")));

        let scratch = tempfile::tempdir_in("/tmp").unwrap();
        fs::create_dir(scratch.path().join("tmp")).unwrap();
        let inner = hiding
            .readdir(&ctx, scratch.path(), defs::NO_HANDLE)
            .unwrap();
        assert!(inner.contains(&OsString::from("tmp")));
    }

    // setfsuid(-1) changes nothing and reports the current value
    fn fs_ids() -> (Uid, Gid) {
        (
            setfsuid(Uid::from_raw(u32::MAX)),
            setfsgid(Gid::from_raw(u32::MAX)),
        )
    }

    #[test]
    fn creation_runs_as_caller_and_restores_fs_ids() {
        let before = fs_ids();
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o777)).unwrap();
        let fs = plain(dir.path());
        let caller = RequestContext {
            uid: 65534,
            gid: 65534,
            pid: std::process::id(),
        };
        let is_root = rustix::process::geteuid().is_root();

        {
            let _identity = FsIdentityGuard::assume(&caller);
            if is_root {
                assert_eq!(fs_ids(), (Uid::from_raw(65534), Gid::from_raw(65534)));
            }
        }
        assert_eq!(fs_ids(), before);

        if is_root {
            fs.mkdir(&caller, Path::new("/made"), 0o755).unwrap();
            let meta = fs::metadata(dir.path().join("made")).unwrap();
            assert_eq!((meta.uid(), meta.gid()), (65534, 65534));
            assert_eq!(fs_ids(), before);
        }

        fs::create_dir(dir.path().join("taken")).unwrap();
        assert!(fs.mkdir(&caller, Path::new("/taken"), 0o755).is_err());
        assert_eq!(fs_ids(), before);
        assert!(fs.symlink(&caller, Path::new("x"), Path::new("/taken")).is_err());
        assert_eq!(fs_ids(), before);
        assert!(fs.link(&caller, Path::new("/absent"), Path::new("/l")).is_err());
        assert_eq!(fs_ids(), before);
        assert!(fs
            .mknod(&caller, Path::new("/taken"), libc::S_IFIFO | 0o644, 0)
            .is_err());
        assert_eq!(fs_ids(), before);
        assert!(fs
            .create(&caller, Path::new("/missing/f"), libc::O_WRONLY, 0o644)
            .is_err());
        assert_eq!(fs_ids(), before);
    }

    #[test]
    fn foreign_open_checks_file_owner() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("secret");
        fs::write(&file, "x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
        let meta = fs::metadata(&file).unwrap();
        let fs = plain(dir.path());

        let stranger = foreign_ctx(meta.uid().wrapping_add(1), meta.gid().wrapping_add(1));
        assert_eq!(
            fs.open(&stranger, Path::new("/secret"), libc::O_RDONLY),
            Err(Errno::ACCESS)
        );

        let owner = foreign_ctx(meta.uid(), meta.gid());
        let fh = fs
            .open(&owner, Path::new("/secret"), libc::O_RDONLY | libc::O_CLOEXEC)
            .unwrap();
        fs.release(&owner, Path::new("/secret"), fh).unwrap();
    }

    #[test]
    fn foreign_access_in_protected_tree_uses_anchor_owner() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".local/share/openfde/media/0");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("doc"), "x").unwrap();
        fs::set_permissions(home.path(), fs::Permissions::from_mode(0o700)).unwrap();
        let meta = fs::metadata(home.path()).unwrap();

        let options = PassthroughOptions {
            bridge_marker: Some(PathBuf::from(".local/share/openfde")),
            ..Default::default()
        };
        let fs = PassthroughFs::new(&root, options);
        assert_eq!(fs.anchor(), Some(home.path()));

        let stranger = foreign_ctx(meta.uid().wrapping_add(1), meta.gid().wrapping_add(1));
        assert_eq!(
            fs.access(&stranger, Path::new("/doc"), libc::R_OK),
            Err(Errno::ACCESS)
        );
        assert_eq!(fs.opendir(&stranger, Path::new("/")), Err(Errno::ACCESS));

        let owner = foreign_ctx(meta.uid(), meta.gid());
        fs.access(&owner, Path::new("/doc"), libc::R_OK).unwrap();
        let fh = fs.opendir(&owner, Path::new("/")).unwrap();
        fs.releasedir(&owner, Path::new("/"), fh).unwrap();
    }

    #[test]
    fn host_mkdir_in_protected_tree_requires_anchor_write() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join(".local/share/openfde/media/0");
        fs::create_dir_all(&root).unwrap();
        let meta = fs::metadata(home.path()).unwrap();
        let options = PassthroughOptions {
            bridge_marker: Some(PathBuf::from(".local/share/openfde")),
            owner_reference: Some(OsString::from("Ringtones")),
            ..Default::default()
        };
        let fs = PassthroughFs::new(&root, options);

        let host = RequestContext {
            uid: meta.uid(),
            gid: meta.gid(),
            pid: std::process::id(),
        };
        fs.mkdir(&host, Path::new("/Created"), 0o755).unwrap();
        let created = fs::metadata(root.join("Created")).unwrap();
        let parent = fs::metadata(&root).unwrap();
        assert_eq!(created.uid(), parent.uid());
        assert_eq!(created.gid(), parent.gid());

        fs::set_permissions(home.path(), fs::Permissions::from_mode(0o500)).unwrap();
        assert_eq!(
            fs.mkdir(&host, Path::new("/Denied"), 0o755),
            Err(Errno::ACCESS)
        );
        assert_eq!(
            fs.create(&host, Path::new("/denied.txt"), libc::O_WRONLY, 0o644),
            Err(Errno::ACCESS)
        );
        assert!(!root.join("Denied").exists());
        fs::set_permissions(home.path(), fs::Permissions::from_mode(0o700)).unwrap();
    }
}
