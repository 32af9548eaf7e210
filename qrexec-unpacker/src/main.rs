//! `qrexec-unpacker` — trigger sandbox helper.
//!
//! ```text
//! qrexec-unpacker user dir [-v] [-w [margin]]
//! ```
//!
//! Matches `qfile-dom0-unpacker.c`'s CLI: resolve `user`, prepare and
//! chroot into `dir`, drop privileges, compute byte/file quota from free
//! space (overridable via `UPDATES_MAX_BYTES`/`UPDATES_MAX_FILES`), then
//! hand off to the unpack routine.

use std::path::PathBuf;

use clap::Parser;

use qrexec_unpacker::quota::{self, Limits, WaitForSpace};
use qrexec_unpacker::sandbox;
use qrexec_unpacker::unpack::{StdinUnpack, Unpack};

/// Trigger sandbox helper for incoming file-copy transfers.
#[derive(Debug, Parser)]
#[command(name = "qrexec-unpacker")]
struct Cli {
    /// User name or numeric uid to run the transfer as.
    user: String,

    /// Directory to chroot into and unpack the transfer under.
    dir: PathBuf,

    /// Enable verbose logging.
    #[arg(short = 'v')]
    verbose: bool,

    /// Wait for at least this many free bytes while writing (default `1`
    /// when the flag is given with no value).
    #[arg(short = 'w', num_args = 0..=1, default_missing_value = "1")]
    wait_for_space: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let user = sandbox::resolve_user(&cli.user)?;
    sandbox::adopt_user_environment(&user)?;

    sandbox::prepare_incoming_dir(&cli.dir)?;
    sandbox::enter_chroot(&cli.dir)?;
    sandbox::drop_real_uid(user.uid)?;

    let free_space = sandbox::free_space_bytes(&cli.dir)?;
    let env_bytes = std::env::var("UPDATES_MAX_BYTES").ok().and_then(|v| v.parse().ok());
    let env_files = std::env::var("UPDATES_MAX_FILES").ok().and_then(|v| v.parse().ok());

    let limits = Limits {
        max_bytes: quota::resolve_max_bytes(free_space, env_bytes),
        max_files: quota::resolve_max_files(env_files),
        wait_for_space: cli.wait_for_space.map_or(WaitForSpace::Disabled, |margin| WaitForSpace::Enabled { margin }),
    };
    tracing::debug!(?limits, "resolved transfer limits");

    let mut stdin = std::io::stdin();
    let code = StdinUnpack.run(&mut stdin, limits, cli.verbose)?;
    std::process::exit(code);
}
