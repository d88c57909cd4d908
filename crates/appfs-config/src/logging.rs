//! Structured logging setup for AppFS binaries and components.
//!
//! Mirrors the teacher's `vrift-config::logging` component-tagging
//! convention, but drives initialization from a single `APPFSD_LOG`
//! environment variable instead of per-crate macros: every crate already
//! carries its own module path via `tracing`'s target field, so a shared
//! `init()` plus `#[instrument]` on hot paths gives the same filterability
//! without the macro boilerplate.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber reading `APPFSD_LOG`
/// (`RUST_LOG`-style directives), falling back to `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env("APPFSD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Same as [`init`], but writes to stderr and drops the ANSI color codes —
/// used by the `--sqlite3` maintenance mode so its stdout stays clean for
/// piping.
pub fn init_quiet() {
    let filter = EnvFilter::try_from_env("APPFSD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
