//! `appfsd`: the AppFS FUSE daemon binary.
//!
//! Wires together the catalog, CAS, fetcher, overlay, and resolver into a
//! mounted filesystem. Also hosts the `--sqlite3` maintenance mode, which
//! bypasses FUSE entirely to run raw SQL against the catalog database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;

use appfs_cas::CasStore;
use appfs_catalog::Catalog;
use appfs_config::Config;
use appfs_fetch::Fetcher;
use appfs_fuse::AppFsFilesystem;
use appfs_overlay::OverlayStore;
use appfs_resolve::{Resolver, SiteKeyring};

/// Default cache directory, mirroring the original daemon's compiled-in
/// `APPFS_CACHEDIR`.
const DEFAULT_CACHEDIR: &str = "/var/cache/appfs";

#[derive(Parser, Debug)]
#[command(
    name = "appfsd",
    about = "Mount a remote software distribution as an on-demand, content-addressed, copy-on-write tree"
)]
struct Cli {
    /// Enable FUSE debug-level tracing
    #[arg(short = 'd')]
    debug: bool,

    /// Run in the foreground (the default; kept for command-line compatibility)
    #[arg(short = 'f')]
    foreground: bool,

    /// Force single-threaded request handling
    #[arg(short = 's')]
    single_threaded: bool,

    /// FUSE-style mount options: nothreads, allow_other, rw (comma-separated,
    /// repeatable)
    #[arg(short = 'o', value_delimiter = ',')]
    options: Vec<String>,

    /// Override the cache directory without going through FUSE's own option
    /// parsing (must precede the positional arguments)
    #[arg(long)]
    cachedir: Option<PathBuf>,

    /// Run one SQL statement against the catalog database and print its
    /// rows, then exit — no mount is performed
    #[arg(long, value_name = "SQL")]
    sqlite3: Option<String>,

    /// Cache directory (ignored when --cachedir is given)
    #[arg(required_unless_present = "sqlite3")]
    cachedir_arg: Option<PathBuf>,

    /// Mount point
    #[arg(required_unless_present = "sqlite3")]
    mountpoint: Option<PathBuf>,
}

/// Set once the FUSE session has actually started accepting requests. The
/// SIGHUP handler consults this before doing anything, matching the
/// original daemon's guard against hot-restarting a filesystem that was
/// never mounted.
static FUSE_STARTED: AtomicBool = AtomicBool::new(false);
static HOT_RESTART_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(_: libc::c_int) {
    if FUSE_STARTED.load(Ordering::SeqCst) {
        HOT_RESTART_REQUESTED.store(true, Ordering::SeqCst);
    }
}

struct ConfigKeyring {
    config: Config,
    cachedir: PathBuf,
}

impl SiteKeyring for ConfigKeyring {
    fn public_key_for(&self, hostname: &str) -> Option<Vec<u8>> {
        self.config.site_public_key(&self.cachedir, hostname).ok().flatten()
    }
}

fn main() -> Result<()> {
    appfs_config::logging::init();

    let cli = Cli::parse();

    let cachedir = cli
        .cachedir
        .or(cli.cachedir_arg.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHEDIR));

    if let Some(sql) = &cli.sqlite3 {
        return run_sqlite3_mode(&cachedir, sql);
    }

    let mountpoint = cli.mountpoint.context("mountpoint is required")?;

    run_daemon(&cli, &cachedir, &mountpoint)
}

/// `--sqlite3 <SQL>`: bypass FUSE, run one statement, print rows as
/// tab-separated text, exit. Matches spec.md §6's maintenance mode.
fn run_sqlite3_mode(cachedir: &Path, sql: &str) -> Result<()> {
    appfs_config::logging::init_quiet();
    let catalog = Catalog::open(cachedir).context("opening catalog")?;
    let rows = catalog.run_sql(sql).context("running SQL")?;
    for row in rows {
        println!("{}", row.join("\t"));
    }
    Ok(())
}

fn run_daemon(cli: &Cli, cachedir: &Path, mountpoint: &Path) -> Result<()> {
    std::fs::create_dir_all(cachedir).context("creating cache directory")?;

    let config = Config::load(cachedir).context("loading configuration")?;

    let catalog = Arc::new(Catalog::open(cachedir).context("opening catalog")?);
    let cas = Arc::new(CasStore::new(cachedir).context("opening CAS store")?);
    let fetcher = Arc::new(Fetcher::new(cas.clone()).context("building HTTP fetcher")?);
    let overlay = Arc::new(OverlayStore::new(cachedir).context("opening overlay store")?);
    let keyring = Arc::new(ConfigKeyring {
        config: config.clone(),
        cachedir: cachedir.to_path_buf(),
    });

    let boot_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let resolver = Arc::new(Resolver::new(
        catalog,
        cas.clone(),
        fetcher,
        overlay.clone(),
        keyring,
        config.resolve.attr_cache_capacity,
        boot_time,
    ));

    let fs = AppFsFilesystem::new(resolver.clone(), overlay, cas, boot_time);

    install_sighup_handler()?;

    #[cfg(target_os = "linux")]
    {
        let mount_options = build_mount_options(cli);
        let _session = fuser::spawn_mount2(fs, mountpoint, &mount_options)
            .with_context(|| format!("mounting {}", mountpoint.display()))?;
        FUSE_STARTED.store(true, Ordering::SeqCst);

        loop {
            std::thread::sleep(std::time::Duration::from_millis(200));
            if HOT_RESTART_REQUESTED.swap(false, Ordering::SeqCst) {
                tracing::info!("hot restart requested via SIGHUP");
                resolver.attr_cache().flush_all();
                resolver.generation().bump();
                // Belt-and-suspenders alongside the generation bump above:
                // `ensure_index_fetched` already treats a generation bump as
                // implicit invalidation, but clear the set outright too so a
                // site's index is refetched even if something else someday
                // changes that comparison.
                resolver.invalidate_all_site_indexes();
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = fs;
        bail!("appfsd only supports Linux (FUSE is a Linux kernel interface)");
    }
}

#[cfg(target_os = "linux")]
fn build_mount_options(cli: &Cli) -> Vec<fuser::MountOption> {
    use fuser::MountOption;

    let mut options = vec![
        MountOption::FSName("appfs".to_string()),
        MountOption::Subtype("appfsd".to_string()),
        MountOption::DefaultPermissions,
    ];

    let running_as_root = unsafe { libc::getuid() } == 0;
    if running_as_root {
        options.push(MountOption::AllowOther);
        options.push(MountOption::Suid);
    }

    for opt in &cli.options {
        match opt.as_str() {
            "nothreads" => {} // fuser dispatches requests on a single thread already
            "allow_other" => options.push(MountOption::AllowOther),
            "rw" => options.push(MountOption::RW),
            other => {
                tracing::warn!(option = other, "ignoring unrecognized -o option");
            }
        }
    }
    if cli.single_threaded {
        // No-op for the same reason as "nothreads" above.
    }
    if cli.debug {
        tracing::info!("FUSE debug mode requested; increase APPFSD_LOG for request-level tracing");
    }

    options
}

fn install_sighup_handler() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_sighup),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGHUP, &action) }.context("installing SIGHUP handler")?;
    Ok(())
}
