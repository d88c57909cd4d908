//! # appfs-overlay
//!
//! Per-user copy-on-write overlay for AppFS (spec.md component C5), plus the
//! fsuid/fsgid impersonation used while touching overlay paths.
//!
//! Layout, rooted at `<cachedir>/overlay`:
//!
//! ```text
//! <cachedir>/overlay/<uid>/<virtualPath>              shadow tree
//! <cachedir>/overlay/<uid>/.tombstone/<virtualPath>   deletion markers
//! ```
//!
//! The distribution tree itself is never written to; every mutation lands
//! here instead, keyed by the calling uid so users cannot see or disturb
//! each other's overlays.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("path too shallow to create: {path}")]
    PathTooShallow { path: String },

    #[error("path component must not be empty or '..': {path}")]
    InvalidPath { path: String },

    #[error("not an overlay-only directory: {path}")]
    NotOverlayOnly { path: String },
}

pub type Result<T> = std::result::Result<T, OverlayError>;

/// Minimum number of path components (site/package/os-arch/version) below
/// which the overlay refuses to synthesize new entries: users can add files
/// inside a version, not invent new sites, packages, or arch trees.
const MIN_CREATE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Create,
}

pub struct OverlayStore {
    root: PathBuf,
}

impl OverlayStore {
    pub fn new<P: AsRef<Path>>(cachedir: P) -> Result<Self> {
        let root = cachedir.as_ref().join("overlay");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn validate(virtual_path: &str) -> Result<()> {
        if virtual_path
            .split('/')
            .any(|component| component.is_empty() || component == "..")
        {
            return Err(OverlayError::InvalidPath {
                path: virtual_path.to_string(),
            });
        }
        Ok(())
    }

    fn depth(virtual_path: &str) -> usize {
        virtual_path.split('/').filter(|c| !c.is_empty()).count()
    }

    fn user_root(&self, uid: u32) -> PathBuf {
        self.root.join(uid.to_string())
    }

    fn shadow_path(&self, uid: u32, virtual_path: &str) -> PathBuf {
        self.user_root(uid).join(virtual_path)
    }

    fn tombstone_path(&self, uid: u32, virtual_path: &str) -> PathBuf {
        self.user_root(uid).join(".tombstone").join(virtual_path)
    }

    /// Whether a deletion marker exists for `virtual_path` under `uid`'s
    /// overlay, i.e. the packaged entry has been locally unlinked.
    pub fn is_tombstoned(&self, uid: u32, virtual_path: &str) -> bool {
        self.tombstone_path(uid, virtual_path).exists()
    }

    /// Whether a shadow copy exists for `virtual_path` under `uid`'s overlay.
    pub fn has_overlay_copy(&self, uid: u32, virtual_path: &str) -> bool {
        self.shadow_path(uid, virtual_path).exists()
    }

    /// For `open(O_CREAT)`, `mknod`, `mkdir`, `symlink`: create parent
    /// directories under the overlay and return the path to create at.
    #[instrument(skip(self))]
    pub fn prepare_to_create(&self, uid: u32, virtual_path: &str) -> Result<PathBuf> {
        Self::validate(virtual_path)?;
        if Self::depth(virtual_path) < MIN_CREATE_DEPTH {
            return Err(OverlayError::PathTooShallow {
                path: virtual_path.to_string(),
            });
        }

        let path = self.shadow_path(uid, virtual_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _ = fs::remove_file(self.tombstone_path(uid, virtual_path));
        Ok(path)
    }

    /// For `truncate`/`chmod`: return the overlay path, copying up from
    /// `packaged_source` first if the path is currently purely packaged.
    /// Copy-up is atomic (copy to a temp file, then rename).
    #[instrument(skip(self, packaged_source))]
    pub fn localpath(
        &self,
        uid: u32,
        virtual_path: &str,
        packaged_source: Option<&Path>,
    ) -> Result<PathBuf> {
        Self::validate(virtual_path)?;
        let shadow = self.shadow_path(uid, virtual_path);
        if shadow.exists() {
            return Ok(shadow);
        }

        if let Some(parent) = shadow.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Some(source) = packaged_source {
            self.copy_up(source, &shadow)?;
        } else {
            File::create(&shadow)?;
        }
        let _ = fs::remove_file(self.tombstone_path(uid, virtual_path));
        Ok(shadow)
    }

    /// For `open`: `Read` returns `packaged_source` if purely packaged and
    /// not overlaid, else the overlay path; `Write` forces copy-up first;
    /// `Create` creates a fresh overlay path.
    #[instrument(skip(self, packaged_source))]
    pub fn openpath(
        &self,
        uid: u32,
        virtual_path: &str,
        mode: OpenMode,
        packaged_source: Option<&Path>,
    ) -> Result<PathBuf> {
        match mode {
            OpenMode::Create => self.prepare_to_create(uid, virtual_path),
            OpenMode::Write => self.localpath(uid, virtual_path, packaged_source),
            OpenMode::Read => {
                Self::validate(virtual_path)?;
                let shadow = self.shadow_path(uid, virtual_path);
                if shadow.exists() {
                    Ok(shadow)
                } else if let Some(source) = packaged_source {
                    Ok(source.to_path_buf())
                } else {
                    Err(OverlayError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        virtual_path.to_string(),
                    )))
                }
            }
        }
    }

    /// Remove the overlay copy of `virtual_path` if present. If the path
    /// still matches a manifest row (`still_packaged`), additionally write
    /// a tombstone so the packaged entry stays hidden from this user.
    #[instrument(skip(self))]
    pub fn unlinkpath(&self, uid: u32, virtual_path: &str, still_packaged: bool) -> Result<()> {
        Self::validate(virtual_path)?;
        let shadow = self.shadow_path(uid, virtual_path);
        match fs::remove_file(&shadow) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if still_packaged {
            let tombstone = self.tombstone_path(uid, virtual_path);
            if let Some(parent) = tombstone.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(&tombstone)?;
        }

        Ok(())
    }

    /// Names directly present under `virtual_dir` in the uid's shadow tree
    /// (new files/directories the user has created there). Used by
    /// `readdir` to merge overlay entries into a manifest-derived listing.
    pub fn overlay_children(&self, uid: u32, virtual_dir: &str) -> Result<Vec<String>> {
        list_dir_names(&self.shadow_path(uid, virtual_dir))
    }

    /// Names directly tombstoned under `virtual_dir` for this uid, i.e.
    /// packaged entries the user has locally unlinked and that `readdir`
    /// must omit.
    pub fn tombstoned_children(&self, uid: u32, virtual_dir: &str) -> Result<Vec<String>> {
        list_dir_names(&self.tombstone_path(uid, virtual_dir))
    }

    /// `rmdir` applies only to directories that exist solely in the
    /// overlay; directories that shadow a packaged directory are not
    /// removable this way.
    #[instrument(skip(self))]
    pub fn remove_overlay_dir(&self, uid: u32, virtual_path: &str, is_packaged: bool) -> Result<()> {
        if is_packaged {
            return Err(OverlayError::NotOverlayOnly {
                path: virtual_path.to_string(),
            });
        }
        Self::validate(virtual_path)?;
        fs::remove_dir(self.shadow_path(uid, virtual_path))?;
        Ok(())
    }

    fn copy_up(&self, source: &Path, dest: &Path) -> Result<()> {
        let parent = dest.parent().expect("shadow paths always have a parent");
        let tmp = parent.join(format!(
            ".{}.{}.copyup",
            dest.file_name().unwrap().to_string_lossy(),
            std::process::id()
        ));
        fs::copy(source, &tmp)?;
        fs::rename(&tmp, dest)?;
        Ok(())
    }
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<String>>>()
            .map_err(Into::into),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Temporarily assume a caller's filesystem uid/gid for the duration of an
/// overlay syscall, so files created there are owned by the user and
/// permission checks against the user's own subtree are honored. Dropping
/// the guard restores uid/gid 0.
pub struct FsIdentityGuard;

impl FsIdentityGuard {
    pub fn enter(uid: u32, gid: u32) -> Self {
        unsafe {
            libc::setfsuid(uid);
            libc::setfsgid(gid);
        }
        FsIdentityGuard
    }
}

impl Drop for FsIdentityGuard {
    fn drop(&mut self) {
        unsafe {
            libc::setfsuid(0);
            libc::setfsgid(0);
        }
    }
}

/// Look up the home directory for `uid`, refusing it if its owner does not
/// match. Mirrors the original daemon's defense against using a spoofed or
/// symlinked home directory as per-user state.
pub fn verified_homedir(uid: u32) -> Option<PathBuf> {
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)).ok().flatten()?;
    let meta = fs::symlink_metadata(&user.dir).ok()?;
    use std::os::unix::fs::MetadataExt;
    if meta.uid() != uid {
        return None;
    }
    Some(user.dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn prepare_to_create_rejects_shallow_paths() {
        let dir = TempDir::new().unwrap();
        let overlay = OverlayStore::new(dir.path()).unwrap();

        let err = overlay.prepare_to_create(1000, "example.com/utils").unwrap_err();
        assert!(matches!(err, OverlayError::PathTooShallow { .. }));
    }

    #[test]
    fn prepare_to_create_allows_in_package_paths() {
        let dir = TempDir::new().unwrap();
        let overlay = OverlayStore::new(dir.path()).unwrap();

        let path = overlay
            .prepare_to_create(1000, "example.com/utils/linux-amd64/1.0/newfile")
            .unwrap();
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn localpath_copies_up_from_packaged_source() {
        let dir = TempDir::new().unwrap();
        let overlay = OverlayStore::new(dir.path()).unwrap();

        let source_dir = TempDir::new().unwrap();
        let source_path = source_dir.path().join("blob");
        fs::write(&source_path, b"packaged content").unwrap();

        let vpath = "example.com/utils/linux-amd64/1.0/bin/ls";
        let local = overlay.localpath(1000, vpath, Some(&source_path)).unwrap();
        assert_eq!(fs::read(&local).unwrap(), b"packaged content");

        // Second call finds the already-copied-up file, no source needed.
        let local2 = overlay.localpath(1000, vpath, None).unwrap();
        assert_eq!(local, local2);
    }

    #[test]
    fn unlinkpath_writes_tombstone_when_still_packaged() {
        let dir = TempDir::new().unwrap();
        let overlay = OverlayStore::new(dir.path()).unwrap();
        let vpath = "example.com/utils/linux-amd64/1.0/bin/ls";

        overlay.unlinkpath(1000, vpath, true).unwrap();
        assert!(overlay.is_tombstoned(1000, vpath));
    }

    #[test]
    fn overlay_and_tombstone_children_are_listed_independently() {
        let dir = TempDir::new().unwrap();
        let overlay = OverlayStore::new(dir.path()).unwrap();
        let vdir = "example.com/utils/linux-amd64/1.0";

        overlay
            .prepare_to_create(1000, &format!("{vdir}/newfile"))
            .and_then(|p| File::create(&p).map_err(Into::into))
            .unwrap();
        overlay.unlinkpath(1000, &format!("{vdir}/bin/ls"), true).unwrap();

        assert_eq!(overlay.overlay_children(1000, vdir).unwrap(), vec!["newfile"]);
        assert_eq!(overlay.overlay_children(1000, "example.com/other/linux-amd64/1.0").unwrap(), Vec::<String>::new());
        assert_eq!(overlay.tombstoned_children(1000, &format!("{vdir}/bin")).unwrap(), vec!["ls"]);
    }

    #[test]
    fn openpath_read_prefers_overlay_over_packaged() {
        let dir = TempDir::new().unwrap();
        let overlay = OverlayStore::new(dir.path()).unwrap();
        let vpath = "example.com/utils/linux-amd64/1.0/bin/ls";

        let source_dir = TempDir::new().unwrap();
        let source_path = source_dir.path().join("blob");
        fs::write(&source_path, b"packaged").unwrap();

        overlay.localpath(1000, vpath, Some(&source_path)).unwrap();
        fs::write(overlay.shadow_path(1000, vpath), b"overlaid").unwrap();

        let resolved = overlay
            .openpath(1000, vpath, OpenMode::Read, Some(&source_path))
            .unwrap();
        assert_eq!(fs::read(resolved).unwrap(), b"overlaid");
    }
}
