//! Cache directory layout helpers.
//!
//! `appfs-cas`, `appfs-catalog`, and `appfs-overlay` each create their own
//! subtree under the cache directory lazily via their `new()`/`open()`
//! constructors. This module exists for the paths a caller (the CLI, the
//! config loader) needs to know about *before* any of those are
//! constructed — principally where a site's pre-provisioned public key or
//! a cache-local config override lives.

use std::path::{Path, PathBuf};

/// `<cachedir>/keys/<hostname>.pub` — the default location of a site's
/// pre-provisioned public key when `[sites.<hostname>]` in config.toml
/// doesn't name an explicit path.
pub fn default_site_key_path(cachedir: &Path, hostname: &str) -> PathBuf {
    cachedir.join("keys").join(format!("{hostname}.pub"))
}

/// `<cachedir>/config.toml` — the cache-directory-local config override,
/// second in the global → cache-local → env layering order.
pub fn local_config_path(cachedir: &Path) -> PathBuf {
    cachedir.join("config.toml")
}

/// `~/.appfs/config.toml` — the global config, first in the layering order.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".appfs").join("config.toml"))
}
