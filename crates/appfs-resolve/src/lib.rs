//! # appfs-resolve
//!
//! The virtual path resolver (spec.md component C6): walks `/hostname/
//! package/os-arch/version/...` against the catalog, triggering index and
//! manifest fetches on demand, composing the per-user overlay on top, and
//! producing a [`PathInfo`] the FUSE adapter can translate directly into
//! `stat(2)` fields. Also hosts the attribute cache (C7) and hot-restart
//! generation counter (C9), since both exist to make this resolution cheap.

pub mod attr_cache;
pub mod generation;
pub mod inode;

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::{Arc, Mutex};

use appfs_cas::{CasStore, Sha1Hash};
use appfs_catalog::{Catalog, FileType as CatalogFileType};
use appfs_fetch::Fetcher;
use appfs_overlay::OverlayStore;
use thiserror::Error;
use tracing::{instrument, warn};

pub use attr_cache::AttrCache;
pub use generation::Generation;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] appfs_fetch::FetchError),
    #[error(transparent)]
    Catalog(#[from] appfs_catalog::CatalogError),
    #[error(transparent)]
    Cas(#[from] appfs_cas::CasError),
    #[error(transparent)]
    Overlay(#[from] appfs_overlay::OverlayError),
    #[error("malformed manifest body served by {hostname}")]
    MalformedManifest { hostname: String },
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// A site's pre-provisioned signing key. Implementers MUST NOT trust an
/// index whose hostname has no registered key.
pub trait SiteKeyring: Send + Sync {
    fn public_key_for(&self, hostname: &str) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathInfo {
    DoesNotExist,
    Directory {
        child_count: u64,
    },
    File {
        size: u64,
        executable: bool,
        suid_root: bool,
        world_accessible: bool,
        blob_hash: Option<Sha1Hash>,
        hostname: Option<String>,
    },
    Symlink {
        target: String,
        size: u64,
    },
    Fifo,
    Socket,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub info: PathInfo,
    pub mtime: u64,
    pub inode: u32,
    pub packaged: bool,
}

impl ResolvedPath {
    fn does_not_exist(path: &str, boot_time: u64) -> Self {
        Self {
            info: PathInfo::DoesNotExist,
            mtime: boot_time,
            inode: inode::fnv1a_inode(path),
            packaged: false,
        }
    }
}

pub struct Resolver {
    catalog: Arc<Catalog>,
    cas: Arc<CasStore>,
    fetcher: Arc<Fetcher>,
    overlay: Arc<OverlayStore>,
    keyring: Arc<dyn SiteKeyring>,
    attr_cache: AttrCache,
    generation: Generation,
    boot_time: u64,
    /// `hostname -> generation at which its index was last (attempted to be)
    /// fetched`. Keyed by generation rather than a plain set so a hot-restart
    /// generation bump (spec.md §4.6) is, by itself, enough to make every
    /// site's index eligible for re-fetch on next reference — no separate
    /// cache to remember to clear.
    fetched_sites: Mutex<HashMap<String, i64>>,
}

impl Resolver {
    pub fn new(
        catalog: Arc<Catalog>,
        cas: Arc<CasStore>,
        fetcher: Arc<Fetcher>,
        overlay: Arc<OverlayStore>,
        keyring: Arc<dyn SiteKeyring>,
        attr_cache_capacity: usize,
        boot_time: u64,
    ) -> Self {
        Self {
            catalog,
            cas,
            fetcher,
            overlay,
            keyring,
            attr_cache: AttrCache::new(attr_cache_capacity),
            generation: Generation::new(),
            boot_time,
            fetched_sites: Mutex::new(HashMap::new()),
        }
    }

    pub fn attr_cache(&self) -> &AttrCache {
        &self.attr_cache
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn overlay(&self) -> &OverlayStore {
        &self.overlay
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cas(&self) -> &CasStore {
        &self.cas
    }

    /// Ensure a packaged file's content blob is present locally, fetching
    /// it from `hostname` if absent. Called at `open` time (spec.md §2's
    /// read data-flow), not at resolve time: resolving a path only needs
    /// the manifest, not every file's bytes.
    pub fn ensure_blob_fetched(&self, hostname: &str, hash: &Sha1Hash) -> Result<()> {
        if self.cas.has(hash) {
            return Ok(());
        }
        self.fetcher.fetch_blob(hostname, hash)?;
        Ok(())
    }

    /// Resolve `path` (leading `/`, as handed to us by FUSE) on behalf of
    /// `uid`, consulting and populating the attribute cache.
    #[instrument(skip(self), fields(path, uid))]
    pub fn resolve(&self, path: &str, uid: u32) -> Result<ResolvedPath> {
        if let Some(cached) = self.attr_cache.get(path, uid) {
            return Ok(cached);
        }

        let resolved = self.resolve_uncached(path, uid)?;
        self.attr_cache.insert(path, uid, resolved.clone());
        Ok(resolved)
    }

    fn resolve_uncached(&self, path: &str, uid: u32) -> Result<ResolvedPath> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let inode = inode::fnv1a_inode(path);

        match segments.as_slice() {
            [] => Ok(ResolvedPath {
                info: PathInfo::Directory {
                    child_count: self.catalog.hostnames()?.len() as u64,
                },
                mtime: self.boot_time,
                inode,
                packaged: false,
            }),

            [hostname] => {
                self.ensure_index_fetched(hostname);
                let packages = self.catalog.packages(hostname)?;
                if packages.is_empty() {
                    return Ok(ResolvedPath::does_not_exist(path, self.boot_time));
                }
                Ok(ResolvedPath {
                    info: PathInfo::Directory {
                        child_count: packages.len() as u64,
                    },
                    mtime: self.boot_time,
                    inode,
                    packaged: false,
                })
            }

            [hostname, package] => {
                let os_arches = self.catalog.os_arches(hostname, package)?;
                if os_arches.is_empty() {
                    return Ok(ResolvedPath::does_not_exist(path, self.boot_time));
                }
                Ok(ResolvedPath {
                    info: PathInfo::Directory {
                        child_count: os_arches.len() as u64,
                    },
                    mtime: self.boot_time,
                    inode,
                    packaged: false,
                })
            }

            [hostname, package, os_arch_label] => {
                let (os, cpu_arch) = appfs_catalog::os_arch::split_os_arch(os_arch_label);
                let versions = self.catalog.versions(hostname, package, &os, &cpu_arch)?;
                if versions.is_empty() {
                    return Ok(ResolvedPath::does_not_exist(path, self.boot_time));
                }
                Ok(ResolvedPath {
                    info: PathInfo::Directory {
                        child_count: versions.len() as u64,
                    },
                    mtime: self.boot_time,
                    inode,
                    packaged: false,
                })
            }

            [hostname, package, os_arch_label, version] => {
                let (os, cpu_arch) = appfs_catalog::os_arch::split_os_arch(os_arch_label);
                let manifest_hash =
                    match self.catalog.manifest_hash_for(hostname, package, &os, &cpu_arch, version)? {
                        Some(h) => h,
                        None => return Ok(ResolvedPath::does_not_exist(path, self.boot_time)),
                    };
                self.ensure_manifest_fetched(hostname, &manifest_hash)?;
                let children = self.catalog.children_in_directory(&manifest_hash, "")?;
                Ok(ResolvedPath {
                    info: PathInfo::Directory {
                        child_count: children.len() as u64,
                    },
                    mtime: self.boot_time,
                    inode,
                    packaged: false,
                })
            }

            [hostname, package, os_arch_label, version, rest @ ..] => {
                let (os, cpu_arch) = appfs_catalog::os_arch::split_os_arch(os_arch_label);
                let manifest_hash =
                    match self.catalog.manifest_hash_for(hostname, package, &os, &cpu_arch, version)? {
                        Some(h) => h,
                        None => return Ok(ResolvedPath::does_not_exist(path, self.boot_time)),
                    };
                self.ensure_manifest_fetched(hostname, &manifest_hash)?;

                let virtual_path = segments.join("/");
                self.resolve_in_package(hostname, &manifest_hash, rest, &virtual_path, uid, inode)
            }
        }
    }

    fn resolve_in_package(
        &self,
        hostname: &str,
        manifest_hash: &Sha1Hash,
        rest: &[&str],
        virtual_path: &str,
        uid: u32,
        inode: u32,
    ) -> Result<ResolvedPath> {
        let (directory, name) = match rest.split_last() {
            Some((name, dir_parts)) => (dir_parts.join("/"), *name),
            None => return Ok(ResolvedPath {
                info: PathInfo::DoesNotExist,
                mtime: self.boot_time,
                inode,
                packaged: false,
            }),
        };

        if self.overlay.is_tombstoned(uid, virtual_path) {
            return Ok(ResolvedPath {
                info: PathInfo::DoesNotExist,
                mtime: self.boot_time,
                inode,
                packaged: false,
            });
        }

        let file_row = self.catalog.lookup_file(manifest_hash, &directory, name)?;

        if self.overlay.has_overlay_copy(uid, virtual_path) {
            let shadow = self
                .overlay
                .openpath(uid, virtual_path, appfs_overlay::OpenMode::Read, None)?;
            let info = pathinfo_from_local(&shadow)?;
            return Ok(ResolvedPath {
                mtime: local_mtime(&shadow).unwrap_or(self.boot_time),
                inode,
                packaged: file_row.is_some(),
                info,
            });
        }

        match file_row {
            Some(row) => Ok(ResolvedPath {
                info: pathinfo_from_row(hostname, &row),
                mtime: row.mtime,
                inode,
                packaged: true,
            }),
            None => Ok(ResolvedPath {
                info: PathInfo::DoesNotExist,
                mtime: self.boot_time,
                inode,
                packaged: false,
            }),
        }
    }

    /// Fetch and ingest `hostname`'s index at most once per hot-restart
    /// generation (spec.md §4.6), unless explicitly invalidated first. A
    /// `SIGHUP`-driven generation bump makes every site's index eligible for
    /// re-fetch again, which is what spec.md §8 scenario 5 ("a subsequent
    /// `getattr` after a site-side index update returns the new version
    /// list") requires. Fetch failures are logged and swallowed: resolution
    /// falls back to whatever rows are already cached (possibly none,
    /// yielding `DoesNotExist`).
    fn ensure_index_fetched(&self, hostname: &str) {
        let current_generation = self.generation.current();
        {
            let mut fetched = self.fetched_sites.lock().unwrap();
            if fetched.get(hostname) == Some(&current_generation) {
                return;
            }
            fetched.insert(hostname.to_string(), current_generation);
        }

        let public_key = match self.keyring.public_key_for(hostname) {
            Some(key) => key,
            None => {
                warn!(hostname, "no provisioned public key; refusing to fetch index");
                return;
            }
        };

        if let Err(e) = self.catalog.ensure_site(hostname, &public_key) {
            warn!(hostname, error = %e, "ensure_site failed");
            return;
        }

        match self.fetcher.fetch_index(hostname, &public_key) {
            Ok(body) => {
                if let Err(e) = self.catalog.ingest_index(hostname, &body) {
                    warn!(hostname, error = %e, "index ingest failed");
                }
            }
            Err(e) => {
                warn!(hostname, error = %e, "index fetch failed, using cached rows");
            }
        }
    }

    /// Force `hostname`'s index to be re-fetched on next reference,
    /// regardless of the current generation.
    pub fn invalidate_site_index(&self, hostname: &str) {
        self.fetched_sites.lock().unwrap().remove(hostname);
    }

    /// Force every known site's index to be re-fetched on next reference.
    /// Bumping [`Resolver::generation`] already achieves this implicitly
    /// (see [`Resolver::ensure_index_fetched`]); this is for callers that
    /// want the effect without touching the generation counter itself.
    pub fn invalidate_all_site_indexes(&self) {
        self.fetched_sites.lock().unwrap().clear();
    }

    /// Enumerate the children `readdir` should show for a directory path,
    /// de-duplicated (spec.md §4.4: "implementations MUST de-duplicate").
    /// At depths 0-3 this is a straight catalog query; at depth 4 and
    /// below it additionally merges in the uid's overlay (new entries
    /// added, tombstoned entries removed).
    #[instrument(skip(self), fields(path, uid))]
    pub fn list_children(&self, path: &str, uid: u32) -> Result<Vec<String>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            [] => Ok(self.catalog.hostnames()?),

            [hostname] => {
                self.ensure_index_fetched(hostname);
                Ok(self.catalog.packages(hostname)?)
            }

            [hostname, package] => Ok(self.catalog.os_arches(hostname, package)?),

            [hostname, package, os_arch_label] => {
                let (os, cpu_arch) = appfs_catalog::os_arch::split_os_arch(os_arch_label);
                Ok(self.catalog.versions(hostname, package, &os, &cpu_arch)?)
            }

            [hostname, package, os_arch_label, version] => {
                let (os, cpu_arch) = appfs_catalog::os_arch::split_os_arch(os_arch_label);
                let manifest_hash = match self
                    .catalog
                    .manifest_hash_for(hostname, package, &os, &cpu_arch, version)?
                {
                    Some(h) => h,
                    None => return Ok(Vec::new()),
                };
                self.ensure_manifest_fetched(hostname, &manifest_hash)?;
                let virtual_dir = segments.join("/");
                self.merge_directory_listing(&manifest_hash, "", &virtual_dir, uid)
            }

            [hostname, package, os_arch_label, version, rest @ ..] => {
                let (os, cpu_arch) = appfs_catalog::os_arch::split_os_arch(os_arch_label);
                let manifest_hash = match self
                    .catalog
                    .manifest_hash_for(hostname, package, &os, &cpu_arch, version)?
                {
                    Some(h) => h,
                    None => return Ok(Vec::new()),
                };
                self.ensure_manifest_fetched(hostname, &manifest_hash)?;
                let directory = rest.join("/");
                let virtual_dir = segments.join("/");
                self.merge_directory_listing(&manifest_hash, &directory, &virtual_dir, uid)
            }
        }
    }

    fn merge_directory_listing(
        &self,
        manifest_hash: &Sha1Hash,
        directory: &str,
        virtual_dir: &str,
        uid: u32,
    ) -> Result<Vec<String>> {
        let mut names: HashSet<String> = self
            .catalog
            .children_in_directory(manifest_hash, directory)?
            .into_iter()
            .collect();

        for tombstoned in self.overlay.tombstoned_children(uid, virtual_dir)? {
            names.remove(&tombstoned);
        }
        for added in self.overlay.overlay_children(uid, virtual_dir)? {
            names.insert(added);
        }

        Ok(names.into_iter().collect())
    }

    fn ensure_manifest_fetched(&self, hostname: &str, manifest_hash: &Sha1Hash) -> Result<()> {
        if self.cas.has(manifest_hash) {
            return Ok(());
        }
        self.fetcher.fetch_blob(hostname, manifest_hash)?;
        let bytes = self.cas.get(manifest_hash)?;
        let text = String::from_utf8(bytes).map_err(|_| ResolveError::MalformedManifest {
            hostname: hostname.to_string(),
        })?;
        self.catalog.ingest_manifest(manifest_hash, &text)?;
        Ok(())
    }
}

fn pathinfo_from_row(hostname: &str, row: &appfs_catalog::FileRow) -> PathInfo {
    match row.file_type {
        CatalogFileType::Directory => PathInfo::Directory { child_count: 0 },
        CatalogFileType::File => {
            let (executable, suid_root, world_accessible) = parse_perms(&row.perms);
            PathInfo::File {
                size: row.size,
                executable,
                suid_root,
                world_accessible,
                blob_hash: row.blob_hash,
                hostname: Some(hostname.to_string()),
            }
        }
        CatalogFileType::Symlink => PathInfo::Symlink {
            target: row.link_target.clone().unwrap_or_default(),
            size: row.link_target.as_ref().map(|t| t.len() as u64).unwrap_or(0),
        },
        CatalogFileType::Fifo => PathInfo::Fifo,
        CatalogFileType::Socket => PathInfo::Socket,
    }
}

/// `perms` flags, per spec.md §3: `x` executable, `U` suid-to-root, `-`
/// world-accessible.
fn parse_perms(perms: &str) -> (bool, bool, bool) {
    let mut executable = false;
    let mut suid_root = false;
    let mut world_accessible = false;
    for c in perms.chars() {
        match c {
            'x' => executable = true,
            'U' => suid_root = true,
            '-' => world_accessible = true,
            _ => {}
        }
    }
    (executable, suid_root, world_accessible)
}

fn pathinfo_from_local(path: &Path) -> Result<PathInfo> {
    let meta = std::fs::symlink_metadata(path).map_err(appfs_cas::CasError::from)?;
    let file_type = meta.file_type();

    if file_type.is_dir() {
        let child_count = std::fs::read_dir(path)
            .map(|rd| rd.count())
            .unwrap_or(0) as u64;
        Ok(PathInfo::Directory { child_count })
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(PathInfo::Symlink {
            size: target.len() as u64,
            target,
        })
    } else if file_type.is_fifo() {
        Ok(PathInfo::Fifo)
    } else if file_type.is_socket() {
        Ok(PathInfo::Socket)
    } else {
        let mode = meta.permissions().mode();
        Ok(PathInfo::File {
            size: meta.len(),
            executable: mode & 0o111 != 0,
            suid_root: false,
            world_accessible: mode & 0o077 != 0,
            blob_hash: None,
            hostname: None,
        })
    }
}

fn local_mtime(path: &Path) -> Option<u64> {
    std::fs::symlink_metadata(path).ok().map(|m| m.mtime() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use appfs_cas::compute_hash;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StaticKeyring(Vec<u8>);
    impl SiteKeyring for StaticKeyring {
        fn public_key_for(&self, _hostname: &str) -> Option<Vec<u8>> {
            Some(self.0.clone())
        }
    }

    fn build_resolver(dir: &TempDir) -> Resolver {
        let catalog = Arc::new(Catalog::open(dir.path()).unwrap());
        let cas = Arc::new(CasStore::new(dir.path()).unwrap());
        let fetcher = Arc::new(Fetcher::new(cas.clone()).unwrap());
        let overlay = Arc::new(OverlayStore::new(dir.path()).unwrap());
        let keyring = Arc::new(StaticKeyring(b"unused-in-these-tests".to_vec()));
        Resolver::new(catalog, cas, fetcher, overlay, keyring, 17, 1_700_000_000)
    }

    #[test]
    fn root_lists_known_hostnames() {
        let dir = TempDir::new().unwrap();
        let resolver = build_resolver(&dir);
        resolver
            .catalog
            .ingest_index(
                "example.com",
                "utils\t1.0\tlinux\tamd64\t0000000000000000000000000000000000000000\t1\n",
            )
            .unwrap();

        let root = resolver.resolve("/", 1000).unwrap();
        assert!(matches!(root.info, PathInfo::Directory { child_count: 1 }));
    }

    #[test]
    fn unknown_site_does_not_exist() {
        let dir = TempDir::new().unwrap();
        let resolver = build_resolver(&dir);
        let result = resolver.resolve("/nosuchhost.example", 1000).unwrap();
        assert_eq!(result.info, PathInfo::DoesNotExist);
    }

    #[test]
    fn in_package_file_resolves_from_manifest() {
        let dir = TempDir::new().unwrap();
        let resolver = build_resolver(&dir);

        let manifest_hash = compute_hash(b"manifest-contents");
        resolver
            .cas
            .insert_bytes(b"manifest-contents")
            .unwrap();

        resolver
            .catalog
            .ingest_index(
                "example.com",
                &format!(
                    "utils\t1.0\tlinux\tamd64\t{}\t1\n",
                    appfs_cas::hash_to_hex(&manifest_hash)
                ),
            )
            .unwrap();
        resolver
            .catalog
            .ingest_manifest(
                &manifest_hash,
                "file\tx-\t1024\t1700000000\tbin\tls\t0000000000000000000000000000000000000000\t\n",
            )
            .unwrap();

        let result = resolver
            .resolve("/example.com/utils/linux-amd64/1.0/bin/ls", 1000)
            .unwrap();
        match result.info {
            PathInfo::File {
                executable,
                world_accessible,
                ..
            } => {
                assert!(executable);
                assert!(world_accessible);
            }
            other => panic!("expected File, got {other:?}"),
        }
        assert!(result.packaged);
    }

    #[test]
    fn tombstoned_overlay_entry_hides_packaged_file() {
        let dir = TempDir::new().unwrap();
        let resolver = build_resolver(&dir);

        let manifest_hash = compute_hash(b"manifest-contents-2");
        resolver.cas.insert_bytes(b"manifest-contents-2").unwrap();
        resolver
            .catalog
            .ingest_index(
                "example.com",
                &format!(
                    "utils\t1.0\tlinux\tamd64\t{}\t1\n",
                    appfs_cas::hash_to_hex(&manifest_hash)
                ),
            )
            .unwrap();
        resolver
            .catalog
            .ingest_manifest(
                &manifest_hash,
                "file\tx-\t1024\t1700000000\tbin\tls\t0000000000000000000000000000000000000000\t\n",
            )
            .unwrap();

        resolver
            .overlay
            .unlinkpath(1000, "example.com/utils/linux-amd64/1.0/bin/ls", true)
            .unwrap();

        let result = resolver
            .resolve("/example.com/utils/linux-amd64/1.0/bin/ls", 1000)
            .unwrap();
        assert_eq!(result.info, PathInfo::DoesNotExist);
    }

    #[test]
    fn readdir_merges_overlay_and_omits_tombstones_per_uid() {
        let dir = TempDir::new().unwrap();
        let resolver = build_resolver(&dir);

        let manifest_hash = compute_hash(b"manifest-contents-3");
        resolver.cas.insert_bytes(b"manifest-contents-3").unwrap();
        resolver
            .catalog
            .ingest_index(
                "example.com",
                &format!(
                    "utils\t1.0\tlinux\tamd64\t{}\t1\n",
                    appfs_cas::hash_to_hex(&manifest_hash)
                ),
            )
            .unwrap();
        resolver
            .catalog
            .ingest_manifest(
                &manifest_hash,
                "file\tx-\t1024\t1700000000\tbin\tls\t0000000000000000000000000000000000000000\t\n",
            )
            .unwrap();

        let vdir = "example.com/utils/linux-amd64/1.0/bin";

        // uid 1000 tombstones `ls` and creates a local `mine` file.
        resolver.overlay.unlinkpath(1000, &format!("{vdir}/ls"), true).unwrap();
        let created = resolver.overlay.prepare_to_create(1000, &format!("{vdir}/mine")).unwrap();
        std::fs::File::create(&created).unwrap();

        let listing_1000 = resolver.list_children(&format!("/{vdir}"), 1000).unwrap();
        assert_eq!(listing_1000, vec!["mine".to_string()]);

        // uid 1001 sees the packaged file untouched and no trace of uid 1000's overlay.
        let listing_1001 = resolver.list_children(&format!("/{vdir}"), 1001).unwrap();
        assert_eq!(listing_1001, vec!["ls".to_string()]);
    }

    #[test]
    fn invalidate_all_site_indexes_clears_every_entry() {
        let dir = TempDir::new().unwrap();
        let resolver = build_resolver(&dir);

        resolver.fetched_sites.lock().unwrap().insert("a.example".to_string(), 0);
        resolver.fetched_sites.lock().unwrap().insert("b.example".to_string(), 0);

        resolver.invalidate_all_site_indexes();

        assert!(resolver.fetched_sites.lock().unwrap().is_empty());
    }

    #[test]
    fn hot_restart_generation_bump_stales_previously_fetched_sites() {
        let dir = TempDir::new().unwrap();
        let resolver = build_resolver(&dir);

        let gen0 = resolver.generation().current();
        resolver
            .fetched_sites
            .lock()
            .unwrap()
            .insert("example.com".to_string(), gen0);
        assert_eq!(
            resolver.fetched_sites.lock().unwrap().get("example.com"),
            Some(&gen0)
        );

        // A SIGHUP-driven bump (appfsd's hot-restart path) must make the
        // recorded generation stale, so `ensure_index_fetched` treats the
        // site as due for re-fetch (spec.md §8 scenario 5).
        let gen1 = resolver.generation().bump();
        assert_ne!(gen0, gen1);
        assert_ne!(
            resolver.fetched_sites.lock().unwrap().get("example.com"),
            Some(&gen1)
        );
    }
}
