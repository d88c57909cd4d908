//! # appfs-fuse
//!
//! FUSE adapter for AppFS (spec.md component C8), plus the hot-restart
//! generation plumbing (C9) that rides alongside every request.
//!
//! Translates kernel callbacks into calls against [`appfs_resolve::Resolver`]
//! (path resolution, attribute cache), [`appfs_overlay::OverlayStore`]
//! (writes), and [`appfs_cas::CasStore`] (packaged file content), mapping
//! core errors to negated errno exactly as spec.md §7's table.
//!
//! `fuser` only exposes the kernel's low-level, inode-addressed protocol, so
//! this adapter keeps a `(FUSE nodeid) -> (virtual path)` table populated on
//! `lookup`/`readdir` — unlike the original C daemon, which used libfuse's
//! high-level path-based API and never needed one. The nodeid assigned to a
//! path *is* spec.md's FNV-1a path inode (zero-extended to 64 bits), with a
//! single exception: the filesystem root must use FUSE's reserved nodeid 1,
//! so it is special-cased rather than computed.

#[cfg(target_os = "linux")]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
        ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    };
    use libc::{c_int, EACCES, EINVAL, EIO, EISDIR, ENAMETOOLONG, ENOENT, ENOTDIR, EPERM};
    use tracing::instrument;

    use appfs_cas::CasStore;
    use appfs_overlay::{FsIdentityGuard, OpenMode, OverlayStore};
    use appfs_resolve::{PathInfo, ResolveError, ResolvedPath, Resolver};

    const TTL: Duration = Duration::from_secs(1);
    const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;
    const PATH_MAX: usize = 4096;

    fn errno_for(err: &ResolveError) -> c_int {
        match err {
            ResolveError::Cas(appfs_cas::CasError::NotFound { .. }) => ENOENT,
            _ => EIO,
        }
    }

    struct NodeTable {
        ino_to_path: HashMap<u64, String>,
    }

    impl NodeTable {
        fn new() -> Self {
            let mut ino_to_path = HashMap::new();
            ino_to_path.insert(ROOT_INO, String::new());
            Self { ino_to_path }
        }

        fn path_for(&self, ino: u64) -> Option<String> {
            self.ino_to_path.get(&ino).cloned()
        }

        /// Register `virtual_path` (no leading slash, `""` for root) and
        /// return the nodeid it maps to.
        fn register(&mut self, virtual_path: &str) -> u64 {
            if virtual_path.is_empty() {
                return ROOT_INO;
            }
            let ino = appfs_resolve::inode::fnv1a_inode(&format!("/{virtual_path}")) as u64;
            self.ino_to_path.insert(ino, virtual_path.to_string());
            ino
        }
    }

    struct OpenFile {
        file: std::fs::File,
        virtual_path: String,
        uid: u32,
        write: bool,
    }

    pub struct AppFsFilesystem {
        resolver: Arc<Resolver>,
        overlay: Arc<OverlayStore>,
        cas: Arc<CasStore>,
        nodes: Mutex<NodeTable>,
        handles: Mutex<HashMap<u64, OpenFile>>,
        next_fh: AtomicU64,
        boot_time: SystemTime,
    }

    impl AppFsFilesystem {
        pub fn new(
            resolver: Arc<Resolver>,
            overlay: Arc<OverlayStore>,
            cas: Arc<CasStore>,
            boot_time_unix: u64,
        ) -> Self {
            Self {
                resolver,
                overlay,
                cas,
                nodes: Mutex::new(NodeTable::new()),
                handles: Mutex::new(HashMap::new()),
                next_fh: AtomicU64::new(1),
                boot_time: UNIX_EPOCH + Duration::from_secs(boot_time_unix),
            }
        }

        pub fn mount(self, mountpoint: &Path, options: &[fuser::MountOption]) -> anyhow::Result<()> {
            fuser::mount2(self, mountpoint, options)?;
            Ok(())
        }

        fn child_path(&self, parent_ino: u64, name: &OsStr) -> Option<String> {
            let parent = self.nodes.lock().unwrap().path_for(parent_ino)?;
            let name = name.to_str()?;
            Some(if parent.is_empty() {
                name.to_string()
            } else {
                format!("{parent}/{name}")
            })
        }

        fn resolve(&self, virtual_path: &str, uid: u32) -> Result<ResolvedPath, c_int> {
            self.resolver
                .resolve(&format!("/{virtual_path}"), uid)
                .map_err(|e| errno_for(&e))
        }

        fn build_attr(&self, ino: u64, resolved: &ResolvedPath, caller_uid: u32, caller_gid: u32) -> FileAttr {
            let mtime = UNIX_EPOCH + Duration::from_secs(resolved.mtime);
            let mut attr = FileAttr {
                ino,
                size: 0,
                blocks: 0,
                atime: mtime,
                mtime,
                ctime: mtime,
                crtime: self.boot_time,
                kind: FileType::RegularFile,
                perm: 0o444,
                nlink: 1,
                uid: 0,
                gid: 0,
                rdev: 0,
                flags: 0,
                blksize: 4096,
            };

            let mut suid_root = false;

            match &resolved.info {
                PathInfo::Directory { child_count } => {
                    attr.kind = FileType::Directory;
                    attr.perm = 0o555;
                    attr.nlink = 2 + *child_count as u32;
                }
                PathInfo::File {
                    size,
                    executable,
                    suid_root: sr,
                    world_accessible,
                    ..
                } => {
                    suid_root = *sr;
                    attr.kind = FileType::RegularFile;
                    attr.size = *size;
                    attr.perm = 0o444;
                    if *executable {
                        attr.perm |= 0o111;
                    }
                    if suid_root {
                        attr.perm |= 0o4000;
                    }
                    if *world_accessible {
                        attr.perm &= !0o077;
                    }
                }
                PathInfo::Symlink { target, size } => {
                    let _ = target;
                    attr.kind = FileType::Symlink;
                    attr.perm = 0o555;
                    attr.size = *size;
                }
                PathInfo::Fifo => {
                    attr.kind = FileType::NamedPipe;
                    attr.perm = 0o555;
                }
                PathInfo::Socket => {
                    attr.kind = FileType::Socket;
                    attr.perm = 0o555;
                }
                PathInfo::DoesNotExist => {}
            }

            if resolved.packaged && !suid_root {
                attr.perm |= 0o200;
                attr.uid = caller_uid;
                attr.gid = caller_gid;
            }

            attr
        }

        fn next_fh(&self) -> u64 {
            self.next_fh.fetch_add(1, Ordering::Relaxed)
        }

        /// Open the local path backing `virtual_path` for read or write,
        /// triggering a blob fetch (spec.md §2's open data-flow) or an
        /// overlay copy-up as needed.
        fn open_local(
            &self,
            virtual_path: &str,
            resolved: &ResolvedPath,
            uid: u32,
            write: bool,
        ) -> Result<PathBuf, c_int> {
            let packaged_source = match &resolved.info {
                PathInfo::File {
                    blob_hash: Some(hash),
                    hostname: Some(hostname),
                    ..
                } if resolved.packaged => {
                    self.resolver
                        .ensure_blob_fetched(hostname, hash)
                        .map_err(|e| errno_for(&e))?;
                    Some(self.cas.path_for(hash))
                }
                _ => None,
            };

            let mode = if write { OpenMode::Write } else { OpenMode::Read };
            self.overlay
                .openpath(uid, virtual_path, mode, packaged_source.as_deref())
                .map_err(|_| EIO)
        }

        fn invalidate_after_mutation(&self, uid: u32) {
            self.resolver.attr_cache().flush_uid(uid);
        }
    }

    impl Filesystem for AppFsFilesystem {
        fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };

            match self.resolve(&path, req.uid()) {
                Ok(resolved) if resolved.info == PathInfo::DoesNotExist => reply.error(ENOENT),
                Ok(resolved) => {
                    let ino = self.nodes.lock().unwrap().register(&path);
                    let attr = self.build_attr(ino, &resolved, req.uid(), req.gid());
                    reply.entry(&TTL, &attr, 0);
                }
                Err(errno) => reply.error(errno),
            }
        }

        fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
            let Some(path) = self.nodes.lock().unwrap().path_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.resolve(&path, req.uid()) {
                Ok(resolved) if resolved.info == PathInfo::DoesNotExist => reply.error(ENOENT),
                Ok(resolved) => reply.attr(&TTL, &self.build_attr(ino, &resolved, req.uid(), req.gid())),
                Err(errno) => reply.error(errno),
            }
        }

        #[instrument(skip(self, req, reply))]
        fn setattr(
            &mut self,
            req: &Request,
            ino: u64,
            mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let Some(path) = self.nodes.lock().unwrap().path_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();
            let gid = req.gid();

            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };

            let packaged_source = match &resolved.info {
                PathInfo::File {
                    blob_hash: Some(hash),
                    ..
                } if resolved.packaged => Some(self.cas.path_for(hash)),
                _ => None,
            };

            let _guard = FsIdentityGuard::enter(uid, gid);
            let local = match self.overlay.localpath(uid, &path, packaged_source.as_deref()) {
                Ok(p) => p,
                Err(_) => {
                    reply.error(EIO);
                    return;
                }
            };

            if let Some(size) = size {
                if let Err(e) = nix::unistd::truncate(&local, size as i64) {
                    reply.error(e as c_int);
                    return;
                }
            }
            if let Some(mode) = mode {
                if let Err(e) = std::fs::set_permissions(&local, std::fs::Permissions::from_mode(mode)) {
                    reply.error(e.raw_os_error().unwrap_or(EIO));
                    return;
                }
            }
            drop(_guard);

            self.invalidate_after_mutation(uid);

            match self.resolve(&path, uid) {
                Ok(resolved) => reply.attr(&TTL, &self.build_attr(ino, &resolved, uid, gid)),
                Err(errno) => reply.error(errno),
            }
        }

        fn readlink(&mut self, req: &Request, ino: u64, reply: ReplyData) {
            let Some(path) = self.nodes.lock().unwrap().path_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.resolve(&path, req.uid()) {
                Ok(ResolvedPath {
                    info: PathInfo::Symlink { target, .. },
                    ..
                }) => {
                    if target.len() > PATH_MAX {
                        reply.error(ENAMETOOLONG);
                    } else {
                        reply.data(target.as_bytes());
                    }
                }
                Ok(resolved) if resolved.info == PathInfo::DoesNotExist => reply.error(ENOENT),
                Ok(_) => reply.error(EINVAL),
                Err(errno) => reply.error(errno),
            }
        }

        fn readdir(&mut self, req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
            let Some(path) = self.nodes.lock().unwrap().path_for(ino) else {
                reply.error(ENOENT);
                return;
            };

            let children = match self.resolver.list_children(&format!("/{path}"), req.uid()) {
                Ok(c) => c,
                Err(e) => {
                    reply.error(errno_for(&e));
                    return;
                }
            };

            let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
            entries.push((ino, FileType::Directory, ".".to_string()));
            entries.push((ino, FileType::Directory, "..".to_string()));

            for name in children {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}/{name}")
                };
                let child_ino = self.nodes.lock().unwrap().register(&child_path);
                let kind = match self.resolve(&child_path, req.uid()) {
                    Ok(r) => match r.info {
                        PathInfo::Directory { .. } => FileType::Directory,
                        PathInfo::Symlink { .. } => FileType::Symlink,
                        PathInfo::Fifo => FileType::NamedPipe,
                        PathInfo::Socket => FileType::Socket,
                        _ => FileType::RegularFile,
                    },
                    Err(_) => FileType::RegularFile,
                };
                entries.push((child_ino, kind, name));
            }

            for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
                if reply.add(ino, (i + 1) as i64, kind, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
            let Some(path) = self.nodes.lock().unwrap().path_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();

            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            if matches!(resolved.info, PathInfo::Directory { .. }) {
                reply.error(EISDIR);
                return;
            }
            if resolved.info == PathInfo::DoesNotExist {
                reply.error(ENOENT);
                return;
            }

            let write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
            let _guard = FsIdentityGuard::enter(uid, req.gid());
            let local = match self.open_local(&path, &resolved, uid, write) {
                Ok(p) => p,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };

            let file = if write {
                std::fs::OpenOptions::new().read(true).write(true).open(&local)
            } else {
                std::fs::File::open(&local)
            };
            drop(_guard);

            let file = match file {
                Ok(f) => f,
                Err(e) => {
                    reply.error(e.raw_os_error().unwrap_or(EIO));
                    return;
                }
            };

            let fh = self.next_fh();
            self.handles.lock().unwrap().insert(
                fh,
                OpenFile {
                    file,
                    virtual_path: path,
                    uid,
                    write,
                },
            );
            reply.opened(fh, 0);
        }

        #[instrument(skip(self, req, reply))]
        fn create(
            &mut self,
            req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            flags: i32,
            reply: ReplyCreate,
        ) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();
            let gid = req.gid();

            let _guard = FsIdentityGuard::enter(uid, gid);
            let local = match self.overlay.prepare_to_create(uid, &path) {
                Ok(p) => p,
                Err(appfs_overlay::OverlayError::PathTooShallow { .. }) => {
                    reply.error(EPERM);
                    return;
                }
                Err(_) => {
                    reply.error(EIO);
                    return;
                }
            };

            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(flags & libc::O_TRUNC != 0)
                .mode(mode)
                .open(&local);
            drop(_guard);

            let file = match file {
                Ok(f) => f,
                Err(e) => {
                    reply.error(e.raw_os_error().unwrap_or(EIO));
                    return;
                }
            };

            self.invalidate_after_mutation(uid);

            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let ino = self.nodes.lock().unwrap().register(&path);
            let attr = self.build_attr(ino, &resolved, uid, gid);

            let fh = self.next_fh();
            self.handles.lock().unwrap().insert(
                fh,
                OpenFile {
                    file,
                    virtual_path: path,
                    uid,
                    write: true,
                },
            );
            reply.created(&TTL, &attr, 0, fh, 0);
        }

        fn read(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            offset: i64,
            size: u32,
            _flags: c_int,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            use std::io::{Read, Seek, SeekFrom};

            let mut handles = self.handles.lock().unwrap();
            let Some(handle) = handles.get_mut(&fh) else {
                reply.error(EIO);
                return;
            };

            if handle.file.seek(SeekFrom::Start(offset as u64)).is_err() {
                reply.error(EIO);
                return;
            }
            let mut buf = vec![0u8; size as usize];
            match handle.file.read(&mut buf) {
                Ok(n) => reply.data(&buf[..n]),
                Err(_) => reply.error(EIO),
            }
        }

        fn write(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            use std::io::{Seek, SeekFrom, Write};

            let mut handles = self.handles.lock().unwrap();
            let Some(handle) = handles.get_mut(&fh) else {
                reply.error(EIO);
                return;
            };
            if !handle.write {
                reply.error(EACCES);
                return;
            }

            if handle.file.seek(SeekFrom::Start(offset as u64)).is_err() {
                reply.error(EIO);
                return;
            }
            // Partial writes are returned honestly, per spec.md §7: the
            // count actually written, whether or not short.
            match handle.file.write(data) {
                Ok(n) => {
                    let path = handle.virtual_path.clone();
                    let uid = handle.uid;
                    drop(handles);
                    self.resolver.attr_cache().remove(&format!("/{path}"), uid);
                    reply.written(n as u32);
                }
                Err(_) => reply.error(EIO),
            }
        }

        fn release(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            if let Some(handle) = self.handles.lock().unwrap().remove(&fh) {
                if handle.write {
                    self.resolver
                        .attr_cache()
                        .remove(&format!("/{}", handle.virtual_path), handle.uid);
                }
            }
            reply.ok();
        }

        #[instrument(skip(self, req, reply))]
        fn mknod(
            &mut self,
            req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            rdev: u32,
            reply: ReplyEntry,
        ) {
            use nix::sys::stat::{mknod, Mode, SFlag};

            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();
            let gid = req.gid();

            let kind = mode & libc::S_IFMT;
            let sflag = match kind {
                libc::S_IFIFO => SFlag::S_IFIFO,
                libc::S_IFSOCK => SFlag::S_IFSOCK,
                libc::S_IFREG | 0 => SFlag::S_IFREG,
                _ => {
                    // Block and character devices are never permitted.
                    reply.error(EPERM);
                    return;
                }
            };

            let _guard = FsIdentityGuard::enter(uid, gid);
            let local = match self.overlay.prepare_to_create(uid, &path) {
                Ok(p) => p,
                Err(_) => {
                    reply.error(EPERM);
                    return;
                }
            };
            let perm = Mode::from_bits_truncate(mode & 0o7777);
            let result = mknod(&local, sflag, perm, rdev as u64);
            drop(_guard);

            if let Err(e) = result {
                reply.error(e as c_int);
                return;
            }

            self.invalidate_after_mutation(uid);
            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let ino = self.nodes.lock().unwrap().register(&path);
            reply.entry(&TTL, &self.build_attr(ino, &resolved, uid, gid), 0);
        }

        #[instrument(skip(self, req, reply))]
        fn mkdir(
            &mut self,
            req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();
            let gid = req.gid();

            let _guard = FsIdentityGuard::enter(uid, gid);
            let local = match self.overlay.prepare_to_create(uid, &path) {
                Ok(p) => p,
                Err(_) => {
                    reply.error(EPERM);
                    return;
                }
            };
            let result = std::fs::create_dir(&local)
                .and_then(|_| std::fs::set_permissions(&local, std::fs::Permissions::from_mode(mode)));
            drop(_guard);

            if let Err(e) = result {
                reply.error(e.raw_os_error().unwrap_or(EIO));
                return;
            }

            self.invalidate_after_mutation(uid);
            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let ino = self.nodes.lock().unwrap().register(&path);
            reply.entry(&TTL, &self.build_attr(ino, &resolved, uid, gid), 0);
        }

        #[instrument(skip(self, req, reply))]
        fn symlink(
            &mut self,
            req: &Request,
            parent: u64,
            link_name: &OsStr,
            target: &Path,
            reply: ReplyEntry,
        ) {
            let Some(path) = self.child_path(parent, link_name) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();
            let gid = req.gid();

            let _guard = FsIdentityGuard::enter(uid, gid);
            let local = match self.overlay.prepare_to_create(uid, &path) {
                Ok(p) => p,
                Err(_) => {
                    reply.error(EPERM);
                    return;
                }
            };
            let result = std::os::unix::fs::symlink(target, &local);
            drop(_guard);

            if let Err(e) = result {
                reply.error(e.raw_os_error().unwrap_or(EIO));
                return;
            }

            self.invalidate_after_mutation(uid);
            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let ino = self.nodes.lock().unwrap().register(&path);
            reply.entry(&TTL, &self.build_attr(ino, &resolved, uid, gid), 0);
        }

        #[instrument(skip(self, req, reply))]
        fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();

            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            if resolved.info == PathInfo::DoesNotExist {
                reply.error(ENOENT);
                return;
            }
            if matches!(resolved.info, PathInfo::Directory { .. }) {
                reply.error(EISDIR);
                return;
            }

            match self.overlay.unlinkpath(uid, &path, resolved.packaged) {
                Ok(()) => {
                    self.invalidate_after_mutation(uid);
                    reply.ok();
                }
                Err(_) => reply.error(EIO),
            }
        }

        #[instrument(skip(self, req, reply))]
        fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            let uid = req.uid();

            let resolved = match self.resolve(&path, uid) {
                Ok(r) => r,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            if resolved.info == PathInfo::DoesNotExist {
                reply.error(ENOENT);
                return;
            }
            if !matches!(resolved.info, PathInfo::Directory { .. }) {
                reply.error(ENOTDIR);
                return;
            }

            match self.overlay.remove_overlay_dir(uid, &path, resolved.packaged) {
                Ok(()) => {
                    self.invalidate_after_mutation(uid);
                    reply.ok();
                }
                Err(appfs_overlay::OverlayError::NotOverlayOnly { .. }) => reply.error(EACCES),
                Err(_) => reply.error(EIO),
            }
        }
    }

    impl std::fmt::Debug for AppFsFilesystem {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("AppFsFilesystem").finish_non_exhaustive()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use appfs_catalog::Catalog;
        use appfs_fetch::Fetcher;
        use tempfile::TempDir;

        struct NoKeyring;
        impl appfs_resolve::SiteKeyring for NoKeyring {
            fn public_key_for(&self, _hostname: &str) -> Option<Vec<u8>> {
                None
            }
        }

        fn fixture(dir: &TempDir) -> AppFsFilesystem {
            let catalog = Arc::new(Catalog::open_in_memory().unwrap());
            let cas = Arc::new(CasStore::new(dir.path().join("cas")).unwrap());
            let fetcher = Arc::new(Fetcher::new(cas.clone()).unwrap());
            let overlay = Arc::new(OverlayStore::new(dir.path().join("overlay")).unwrap());
            let resolver = Arc::new(Resolver::new(
                catalog,
                cas.clone(),
                fetcher,
                overlay.clone(),
                Arc::new(NoKeyring),
                64,
                1_700_000_000,
            ));
            AppFsFilesystem::new(resolver, overlay, cas, 1_700_000_000)
        }

        #[test]
        fn root_path_registers_to_fuse_root_id() {
            let mut nodes = NodeTable::new();
            assert_eq!(nodes.register(""), ROOT_INO);
            assert_eq!(nodes.path_for(ROOT_INO), Some(String::new()));
        }

        #[test]
        fn non_root_path_hashes_to_its_own_inode() {
            let mut nodes = NodeTable::new();
            let ino = nodes.register("example.com/utils");
            assert_ne!(ino, ROOT_INO);
            assert_eq!(nodes.path_for(ino), Some("example.com/utils".to_string()));
        }

        #[test]
        fn same_path_always_registers_to_the_same_inode() {
            let mut nodes = NodeTable::new();
            let a = nodes.register("example.com/utils/linux-amd64/1.0/bin/ls");
            let b = nodes.register("example.com/utils/linux-amd64/1.0/bin/ls");
            assert_eq!(a, b);
        }

        #[test]
        fn directory_attr_is_read_only_with_link_count_from_child_count() {
            let dir = TempDir::new().unwrap();
            let fs = fixture(&dir);
            let resolved = ResolvedPath {
                info: PathInfo::Directory { child_count: 3 },
                mtime: 1_700_000_000,
                inode: 42,
                packaged: false,
            };
            let attr = fs.build_attr(42, &resolved, 1000, 1000);
            assert_eq!(attr.kind, FileType::Directory);
            assert_eq!(attr.perm, 0o555);
            assert_eq!(attr.nlink, 5);
        }

        #[test]
        fn executable_packaged_file_is_writable_by_owner_and_chowned_to_caller() {
            let dir = TempDir::new().unwrap();
            let fs = fixture(&dir);
            let resolved = ResolvedPath {
                info: PathInfo::File {
                    size: 1024,
                    executable: true,
                    suid_root: false,
                    world_accessible: false,
                    blob_hash: None,
                    hostname: None,
                },
                mtime: 1_700_000_000,
                inode: 99,
                packaged: true,
            };
            let attr = fs.build_attr(99, &resolved, 1000, 1000);
            assert_eq!(attr.perm, 0o444 | 0o111 | 0o200);
            assert_eq!(attr.uid, 1000);
            assert_eq!(attr.gid, 1000);
        }

        #[test]
        fn suid_root_file_is_never_made_writable_by_the_caller() {
            let dir = TempDir::new().unwrap();
            let fs = fixture(&dir);
            let resolved = ResolvedPath {
                info: PathInfo::File {
                    size: 2048,
                    executable: true,
                    suid_root: true,
                    world_accessible: false,
                    blob_hash: None,
                    hostname: None,
                },
                mtime: 1_700_000_000,
                inode: 7,
                packaged: true,
            };
            let attr = fs.build_attr(7, &resolved, 1000, 1000);
            assert_eq!(attr.perm, 0o444 | 0o111 | 0o4000);
            assert_eq!(attr.uid, 0);
            assert_eq!(attr.gid, 0);
        }

        #[test]
        fn world_accessible_file_drops_group_and_other_bits_before_owner_bits_are_added() {
            let dir = TempDir::new().unwrap();
            let fs = fixture(&dir);
            let resolved = ResolvedPath {
                info: PathInfo::File {
                    size: 10,
                    executable: false,
                    suid_root: false,
                    world_accessible: true,
                    blob_hash: None,
                    hostname: None,
                },
                mtime: 1_700_000_000,
                inode: 5,
                packaged: false,
            };
            let attr = fs.build_attr(5, &resolved, 1000, 1000);
            assert_eq!(attr.perm, 0o400);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::path::Path;
    use std::sync::Arc;

    use appfs_cas::CasStore;
    use appfs_overlay::OverlayStore;
    use appfs_resolve::Resolver;

    /// Stub adapter on non-Linux targets: AppFS's FUSE surface is
    /// Linux-only, matching spec.md §1's acceptance of the FUSE kernel
    /// interface as an external given.
    pub struct AppFsFilesystem;

    impl AppFsFilesystem {
        pub fn new(_resolver: Arc<Resolver>, _overlay: Arc<OverlayStore>, _cas: Arc<CasStore>, _boot_time_unix: u64) -> Self {
            Self
        }

        pub fn mount(self, _mountpoint: &Path, _options: &[()]) -> anyhow::Result<()> {
            anyhow::bail!("FUSE mounting is only supported on Linux")
        }
    }
}

pub use imp::AppFsFilesystem;
