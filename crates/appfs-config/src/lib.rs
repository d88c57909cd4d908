//! # appfs-config
//!
//! Layered configuration for `appfsd`: global file, cache-directory-local
//! override, then environment variables, in that order — the same
//! global→project→env layering `vrift-config::Config::load_for_project`
//! uses, adapted to AppFS's single cache-directory deployment model (there
//! is no project root to discover; the cache directory plays that role).
//!
//! Also hosts cache-directory layout helpers ([`path`]) and the shared
//! `tracing` setup ([`logging`]).

pub mod logging;
pub mod path;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("site public key for {hostname} could not be read from {path}: {source}")]
    SiteKey {
        hostname: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("site public key for {hostname} is not valid base64: {source}")]
    SiteKeyEncoding {
        hostname: String,
        #[source]
        source: base64::DecodeError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const CONFIG_VERSION: u32 = 1;

/// `appfsd`'s fully-resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_version: u32,
    pub fetch: FetchConfig,
    pub resolve: ResolveConfig,
    /// `hostname -> site key provisioning`. Keys present here are the only
    /// sites `appfsd` will ever trust an index signature from (spec.md §1
    /// Non-goals: trust-on-first-use with a pre-provisioned key per site).
    pub sites: HashMap<String, SiteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            fetch: FetchConfig::default(),
            resolve: ResolveConfig::default(),
            sites: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub http_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Attribute cache slot count (spec.md §4.6 default: 8209).
    pub attr_cache_capacity: usize,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            attr_cache_capacity: 8209,
        }
    }
}

/// One site's provisioning entry. Either `public_key_path` names a file
/// holding the raw DER-encoded RSA public key (base64 text, one line), or
/// `public_key_base64` inlines it directly in config. At most one should
/// be set; `public_key_path` wins if both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub public_key_path: Option<PathBuf>,
    pub public_key_base64: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            public_key_path: None,
            public_key_base64: None,
        }
    }
}

impl Config {
    /// Load configuration for a cache directory: global file, then
    /// `<cachedir>/config.toml`, then `APPFS_*` environment variables,
    /// each layer overriding the previous.
    pub fn load(cachedir: &Path) -> Result<Self> {
        let mut config = Config::default();

        if let Some(global_path) = path::global_config_path() {
            if global_path.exists() {
                config.merge_file(&global_path)?;
            }
        }

        let local_path = path::local_config_path(cachedir);
        if local_path.exists() {
            config.merge_file(&local_path)?;
        }

        config.merge_env();

        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: Config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        *self = parsed.overlay_onto(std::mem::take(self));
        Ok(())
    }

    /// `self` (freshly parsed file) wins over `base` (the accumulated
    /// config so far) for every scalar field; `sites` is merged key-wise
    /// so a later layer can add sites without dropping earlier ones.
    fn overlay_onto(self, mut base: Config) -> Config {
        base.config_version = self.config_version;
        base.fetch = self.fetch;
        base.resolve = self.resolve;
        for (hostname, site) in self.sites {
            base.sites.insert(hostname, site);
        }
        base
    }

    fn merge_env(&mut self) {
        if let Ok(v) = std::env::var("APPFS_HTTP_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.fetch.http_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("APPFS_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.fetch.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("APPFS_ATTR_CACHE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.resolve.attr_cache_capacity = n;
            }
        }
    }

    /// Resolve `hostname`'s pre-provisioned public key (DER bytes), trying
    /// the configured path/inline base64, then the cache-directory default
    /// location (`<cachedir>/keys/<hostname>.pub`, one base64 line).
    pub fn site_public_key(&self, cachedir: &Path, hostname: &str) -> Result<Option<Vec<u8>>> {
        if let Some(site) = self.sites.get(hostname) {
            if let Some(inline) = &site.public_key_base64 {
                return decode_key(hostname, inline).map(Some);
            }
            if let Some(key_path) = &site.public_key_path {
                return read_key_file(hostname, key_path).map(Some);
            }
        }

        let default_path = path::default_site_key_path(cachedir, hostname);
        if default_path.exists() {
            return read_key_file(hostname, &default_path).map(Some);
        }

        Ok(None)
    }
}

fn read_key_file(hostname: &str, path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::SiteKey {
        hostname: hostname.to_string(),
        path: path.to_path_buf(),
        source,
    })?;
    decode_key(hostname, text.trim())
}

fn decode_key(hostname: &str, encoded: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|source| ConfigError::SiteKeyEncoding {
            hostname: hostname.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_nothing_on_disk() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.resolve.attr_cache_capacity, 8209);
        assert_eq!(config.fetch.max_retries, 3);
    }

    #[test]
    fn local_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            path::local_config_path(dir.path()),
            "[resolve]\nattr_cache_capacity = 101\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.resolve.attr_cache_capacity, 101);
    }

    #[test]
    fn env_var_overrides_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            path::local_config_path(dir.path()),
            "[resolve]\nattr_cache_capacity = 101\n",
        )
        .unwrap();

        std::env::set_var("APPFS_ATTR_CACHE_CAPACITY", "55");
        let config = Config::load(dir.path()).unwrap();
        std::env::remove_var("APPFS_ATTR_CACHE_CAPACITY");

        assert_eq!(config.resolve.attr_cache_capacity, 55);
    }

    #[test]
    fn site_key_resolves_from_default_cachedir_location() {
        use base64::Engine;
        let dir = TempDir::new().unwrap();
        let keys_dir = dir.path().join("keys");
        fs::create_dir_all(&keys_dir).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"der-bytes");
        fs::write(keys_dir.join("example.com.pub"), &encoded).unwrap();

        let config = Config::load(dir.path()).unwrap();
        let key = config
            .site_public_key(dir.path(), "example.com")
            .unwrap()
            .unwrap();
        assert_eq!(key, b"der-bytes");
    }
}
