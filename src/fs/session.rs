// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::HashMap,
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use rustix::{fs::Stat, io::Errno};

use super::passthrough::{OpResult, PathFilesystem, RequestContext, SetTime};
use crate::defs;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INODE: u64 = fuser::FUSE_ROOT_ID;

struct InodeEntry {
    path: PathBuf,
    lookups: u64,
}

/// Maps kernel inode numbers to virtual paths.
pub struct InodeTable {
    by_inode: HashMap<u64, InodeEntry>,
    by_path: HashMap<PathBuf, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            by_inode: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INODE + 1,
        };
        table.by_inode.insert(
            ROOT_INODE,
            InodeEntry {
                path: PathBuf::from("/"),
                lookups: 1,
            },
        );
        table.by_path.insert(PathBuf::from("/"), ROOT_INODE);
        table
    }

    pub fn path(&self, inode: u64) -> Option<&Path> {
        self.by_inode.get(&inode).map(|e| e.path.as_path())
    }

    pub fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Records a lookup of `path`, returning its inode.
    pub fn remember(&mut self, path: &Path) -> u64 {
        if let Some(&inode) = self.by_path.get(path) {
            if let Some(entry) = self.by_inode.get_mut(&inode) {
                entry.lookups += 1;
            }
            return inode;
        }
        let inode = self.next;
        self.next += 1;
        self.by_inode.insert(
            inode,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        self.by_path.insert(path.to_path_buf(), inode);
        inode
    }

    pub fn forget(&mut self, inode: u64, count: u64) {
        if inode == ROOT_INODE {
            return;
        }
        let gone = match self.by_inode.get_mut(&inode) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(count);
                entry.lookups == 0
            }
            None => false,
        };
        if gone && let Some(entry) = self.by_inode.remove(&inode) {
            self.by_path.remove(&entry.path);
        }
    }

    /// Re-keys `from` and everything below it to live under `to`.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        if let Some(displaced) = self.by_path.remove(to) {
            self.by_inode.remove(&displaced);
        }
        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, inode)| (path.clone(), *inode))
            .collect();
        for (old, inode) in moved {
            let Ok(suffix) = old.strip_prefix(from) else {
                continue;
            };
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            self.by_path.remove(&old);
            self.by_path.insert(new.clone(), inode);
            if let Some(entry) = self.by_inode.get_mut(&inode) {
                entry.path = new;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_inode.len()
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

pub fn attr_from_stat(inode: u64, st: &Stat) -> FileAttr {
    let mode = st.st_mode as u32;
    FileAttr {
        ino: inode,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime as i64, st.st_atime_nsec as i64),
        mtime: system_time(st.st_mtime as i64, st.st_mtime_nsec as i64),
        ctime: system_time(st.st_ctime as i64, st.st_ctime_nsec as i64),
        crtime: system_time(st.st_ctime as i64, st.st_ctime_nsec as i64),
        kind: file_type(mode),
        perm: (mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn set_time(value: Option<TimeOrNow>) -> SetTime {
    match value {
        None => SetTime::Omit,
        Some(TimeOrNow::Now) => SetTime::Now,
        Some(TimeOrNow::SpecificTime(t)) => SetTime::At(t),
    }
}

fn context(req: &Request<'_>) -> RequestContext {
    RequestContext {
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
    }
}

fn code(e: Errno) -> i32 {
    e.raw_os_error()
}

/// Kernel-facing session translating inode requests onto a [`PathFilesystem`].
pub struct BridgeSession<F: PathFilesystem> {
    inner: F,
    inodes: InodeTable,
}

impl<F: PathFilesystem> BridgeSession<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            inodes: InodeTable::new(),
        }
    }

    fn path(&self, inode: u64) -> OpResult<PathBuf> {
        self.inodes
            .path(inode)
            .map(Path::to_path_buf)
            .ok_or(Errno::NOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> OpResult<PathBuf> {
        self.inodes.child(parent, name).ok_or(Errno::NOENT)
    }

    fn entry(&mut self, ctx: &RequestContext, path: &Path) -> OpResult<FileAttr> {
        let st = self.inner.getattr(ctx, path, defs::NO_HANDLE)?;
        let inode = self.inodes.remember(path);
        Ok(attr_from_stat(inode, &st))
    }

    fn reply_entry(&mut self, ctx: &RequestContext, path: &Path, reply: ReplyEntry) {
        match self.entry(ctx, path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(code(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &mut self,
        ctx: &RequestContext,
        inode: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> OpResult<FileAttr> {
        let path = self.path(inode)?;
        let fh = fh.unwrap_or(defs::NO_HANDLE);
        if let Some(mode) = mode {
            self.inner.chmod(ctx, &path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.inner.chown(ctx, &path, uid, gid)?;
        }
        if let Some(size) = size {
            self.inner.truncate(ctx, &path, size, fh)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.inner
                .utimens(ctx, &path, set_time(atime), set_time(mtime))?;
        }
        let st = self.inner.getattr(ctx, &path, fh)?;
        Ok(attr_from_stat(inode, &st))
    }
}

impl<F: PathFilesystem> Filesystem for BridgeSession<F> {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let ctx = context(req);
        match self.child(parent, name) {
            Ok(path) => self.reply_entry(&ctx, &path, reply),
            Err(e) => reply.error(code(e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let ctx = context(req);
        let result = self.path(ino).and_then(|path| {
            self.inner
                .getattr(&ctx, &path, fh.unwrap_or(defs::NO_HANDLE))
        });
        match result {
            Ok(st) => reply.attr(&TTL, &attr_from_stat(ino, &st)),
            Err(e) => reply.error(code(e)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ctx = context(req);
        match self.apply_setattr(&ctx, ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(code(e)),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let ctx = context(req);
        match self
            .path(ino)
            .and_then(|path| self.inner.readlink(&ctx, &path))
        {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(code(e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let ctx = context(req);
        let result = self.child(parent, name).and_then(|path| {
            self.inner.mknod(&ctx, &path, mode, rdev as u64)?;
            Ok(path)
        });
        match result {
            Ok(path) => self.reply_entry(&ctx, &path, reply),
            Err(e) => reply.error(code(e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let ctx = context(req);
        let result = self.child(parent, name).and_then(|path| {
            self.inner.mkdir(&ctx, &path, mode)?;
            Ok(path)
        });
        match result {
            Ok(path) => self.reply_entry(&ctx, &path, reply),
            Err(e) => reply.error(code(e)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = context(req);
        match self
            .child(parent, name)
            .and_then(|path| self.inner.unlink(&ctx, &path))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(code(e)),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let ctx = context(req);
        match self
            .child(parent, name)
            .and_then(|path| self.inner.rmdir(&ctx, &path))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(code(e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let ctx = context(req);
        let result = self.child(parent, link_name).and_then(|path| {
            self.inner.symlink(&ctx, target, &path)?;
            Ok(path)
        });
        match result {
            Ok(path) => self.reply_entry(&ctx, &path, reply),
            Err(e) => reply.error(code(e)),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let ctx = context(req);
        let paths = self
            .child(parent, name)
            .and_then(|from| Ok((from, self.child(newparent, newname)?)));
        let (from, to) = match paths {
            Ok(paths) => paths,
            Err(e) => {
                reply.error(code(e));
                return;
            }
        };
        match self.inner.rename(&ctx, &from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(code(e)),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let ctx = context(req);
        let result = self.path(ino).and_then(|old| {
            let new = self.child(newparent, newname)?;
            self.inner.link(&ctx, &old, &new)?;
            Ok(new)
        });
        match result {
            Ok(path) => self.reply_entry(&ctx, &path, reply),
            Err(e) => reply.error(code(e)),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let ctx = context(req);
        match self
            .path(ino)
            .and_then(|path| self.inner.open(&ctx, &path, flags))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(code(e)),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let ctx = context(req);
        let mut buf = vec![0u8; size as usize];
        let result = self
            .path(ino)
            .and_then(|path| self.inner.read(&ctx, &path, &mut buf, offset as u64, fh));
        match result {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(code(e)),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let ctx = context(req);
        let result = self
            .path(ino)
            .and_then(|path| self.inner.write(&ctx, &path, data, offset as u64, fh));
        match result {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(code(e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let ctx = context(req);
        let path = self.path(ino).unwrap_or_default();
        match self.inner.release(&ctx, &path, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(code(e)),
        }
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let ctx = context(req);
        match self
            .path(ino)
            .and_then(|path| self.inner.fsync(&ctx, &path, datasync, fh))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(code(e)),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let ctx = context(req);
        match self
            .path(ino)
            .and_then(|path| self.inner.opendir(&ctx, &path))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(code(e)),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ctx = context(req);
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(code(e));
                return;
            }
        };
        let names = match self.inner.readdir(&ctx, &path, fh) {
            Ok(names) => names,
            Err(e) => {
                reply.error(code(e));
                return;
            }
        };
        let start = offset.max(0) as usize;
        for (idx, name) in names.iter().enumerate().skip(start) {
            let (inode, kind) = match name.as_bytes() {
                b"." => (ino, FileType::Directory),
                b".." => (ROOT_INODE, FileType::Directory),
                _ => {
                    let child = path.join(name);
                    let kind = self
                        .inner
                        .getattr(&ctx, &child, defs::NO_HANDLE)
                        .map(|st| file_type(st.st_mode as u32))
                        .unwrap_or(FileType::RegularFile);
                    // readdir does not take a lookup reference
                    let inode = self
                        .inodes
                        .by_path
                        .get(&child)
                        .copied()
                        .unwrap_or(u64::MAX - idx as u64);
                    (inode, kind)
                }
            };
            if reply.add(inode, (idx + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let ctx = context(req);
        let path = self.path(ino).unwrap_or_default();
        match self.inner.releasedir(&ctx, &path, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(code(e)),
        }
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let ctx = context(req);
        match self
            .path(ino)
            .and_then(|path| self.inner.statfs(&ctx, &path))
        {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(e) => reply.error(code(e)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let ctx = context(req);
        match self
            .path(ino)
            .and_then(|path| self.inner.access(&ctx, &path, mask))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(code(e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let ctx = context(req);
        let created = self.child(parent, name).and_then(|path| {
            let fh = self.inner.create(&ctx, &path, flags, mode)?;
            Ok((path, fh))
        });
        let (path, fh) = match created {
            Ok(v) => v,
            Err(e) => {
                reply.error(code(e));
                return;
            }
        };
        match self.entry(&ctx, &path) {
            Ok(attr) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => {
                if let Err(release) = self.inner.release(&ctx, &path, fh) {
                    tracing::debug!(path = %path.display(), error = %release, "release_after_create");
                }
                reply.error(code(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE), Some(Path::new("/")));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.child(ROOT_INODE, OsStr::new("docs")),
            Some(PathBuf::from("/docs"))
        );
        assert_eq!(table.child(42, OsStr::new("docs")), None);
    }

    #[test]
    fn lookups_are_counted_until_forgotten() {
        let mut table = InodeTable::new();
        let a = table.remember(Path::new("/a"));
        assert_eq!(table.remember(Path::new("/a")), a);
        table.forget(a, 1);
        assert_eq!(table.path(a), Some(Path::new("/a")));
        table.forget(a, 1);
        assert_eq!(table.path(a), None);
        assert_ne!(table.remember(Path::new("/a")), a);

        table.forget(ROOT_INODE, 10);
        assert_eq!(table.path(ROOT_INODE), Some(Path::new("/")));
    }

    #[test]
    fn rename_moves_descendants() {
        let mut table = InodeTable::new();
        let dir = table.remember(Path::new("/old"));
        let file = table.remember(Path::new("/old/inner/f"));
        let other = table.remember(Path::new("/older"));
        table.rename(Path::new("/old"), Path::new("/new"));
        assert_eq!(table.path(dir), Some(Path::new("/new")));
        assert_eq!(table.path(file), Some(Path::new("/new/inner/f")));
        assert_eq!(table.path(other), Some(Path::new("/older")));
    }

    #[test]
    fn attributes_follow_stat() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"abc").unwrap();
        let st = rustix::fs::stat(&file).unwrap();
        let attr = attr_from_stat(7, &st);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.uid, st.st_uid);

        let st = rustix::fs::stat(dir.path()).unwrap();
        assert_eq!(attr_from_stat(1, &st).kind, FileType::Directory);
    }

    #[test]
    fn negative_times_are_before_epoch() {
        assert!(system_time(-5, 0) < UNIX_EPOCH);
        assert_eq!(
            system_time(2, 500),
            UNIX_EPOCH + Duration::new(2, 500)
        );
    }
}
