//! `qrexec-client` — connects to a per-guest daemon's local socket, issues
//! one exec/just-exec/service-connect request, and pumps the resulting
//! data channel.
//!
//! ```text
//! qrexec-client [-w timeout] [-W] [-t] [-T] -d domain
//!     {-l local_prog | -c request_id,src_domain_name,src_domain_id | -e}
//!     remote_cmdline
//! ```
//!
//! Matches `qrexec-client.c`'s CLI: exactly one of `-e`/`-l`/`-c` selects
//! the call's role, and `dom0` as the target domain requires `-c` (a
//! request from dom0 can only ever be fulfilling a guest-triggered
//! service, never originating one).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::process::Command;

use qrexec_client::handshake::{self, Request};
use qrexec_client::pump::{self, FilterConfig};

/// Local CLI for invoking qrexec services.
#[derive(Debug, Parser)]
#[command(name = "qrexec-client")]
struct Cli {
    /// Connection-establishment timeout in seconds (default 5; `0` disables it).
    #[arg(short = 'w')]
    timeout: Option<u64>,

    /// Wait indefinitely for the connection to establish, ignoring `-w`.
    #[arg(short = 'W')]
    wait_indefinitely: bool,

    /// Filter non-printable bytes out of the remote's stdout.
    #[arg(short = 't')]
    filter_stdout: bool,

    /// Filter non-printable bytes out of the remote's stderr.
    #[arg(short = 'T')]
    filter_stderr: bool,

    /// Target domain (name or numeric id) to run in.
    #[arg(short = 'd')]
    domain: String,

    /// Run this local program instead of inheriting the CLI's own stdio,
    /// piping its stdio through the data channel (initiator role).
    #[arg(short = 'l')]
    local_prog: Option<String>,

    /// Join an already-triggered service by `request_id,src_domain_name,src_domain_id`
    /// (responder role) instead of originating a new call.
    #[arg(short = 'c')]
    service_connect: Option<String>,

    /// Request execution without piping stdio at all; the daemon does not
    /// wait for completion.
    #[arg(short = 'e')]
    just_exec: bool,

    /// Command line to run, e.g. `user:/bin/sh -c 'echo hi'`.
    remote_cmdline: String,
}

/// Parsed `-c request_id,src_domain_name,src_domain_id`.
struct ServiceConnectArgs {
    request_id: String,
    src_domain_name: String,
    #[allow(dead_code)]
    src_domain_id: i32,
}

impl std::str::FromStr for ServiceConnectArgs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ',');
        let request_id = parts.next().filter(|s| !s.is_empty());
        let src_domain_name = parts.next().filter(|s| !s.is_empty());
        let src_domain_id = parts.next().filter(|s| !s.is_empty());
        match (request_id, src_domain_name, src_domain_id) {
            (Some(request_id), Some(src_domain_name), Some(src_domain_id)) => Ok(Self {
                request_id: request_id.to_owned(),
                src_domain_name: src_domain_name.to_owned(),
                src_domain_id: src_domain_id
                    .parse()
                    .context("parsing src_domain_id in -c argument")?,
            }),
            _ => bail!("-c requires request_id,src_domain_name,src_domain_id"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = FilterConfig {
        stdout: cli.filter_stdout,
        stderr: cli.filter_stderr,
    };

    let role_count =
        usize::from(cli.local_prog.is_some()) + usize::from(cli.service_connect.is_some()) + usize::from(cli.just_exec);
    if role_count != 1 {
        bail!("exactly one of -l, -c, or -e must be given");
    }
    if cli.domain == "dom0" && cli.service_connect.is_none() {
        bail!("-d dom0 requires -c");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the client's single-threaded runtime")?;

    let timeout = if cli.wait_indefinitely {
        Duration::ZERO
    } else {
        Duration::from_secs(cli.timeout.unwrap_or(5))
    };

    let exit_code = match runtime.block_on(async_main(cli, timeout, filter)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "qrexec-client failed");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn async_main(cli: Cli, timeout: Duration, filter: FilterConfig) -> anyhow::Result<i32> {
    let socket_dir = std::env::var("QREXEC_SOCKET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default_socket_dir()));
    let socket_path = socket_dir.join(format!("qrexec.{}", cli.domain));

    if cli.just_exec {
        let request = Request::JustExec {
            target_domain: resolve_domain_id(&cli.domain),
            cmdline: cli.remote_cmdline.clone(),
        };
        handshake::connect(&socket_path, request, timeout).await?;
        return Ok(0);
    }

    if let Some(service_connect) = &cli.service_connect {
        let args: ServiceConnectArgs = service_connect.parse()?;
        let request = Request::ServiceConnect {
            request_id: args.request_id,
        };
        let channel = handshake::connect(&socket_path, request, timeout).await?;

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cli.remote_cmdline)
            .env("QREXEC_REMOTE_DOMAIN", &args.src_domain_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning the local service handler")?;
        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take().expect("piped stdout");
        let child_stderr = child.stderr.take().expect("piped stderr");

        let code = pump::run_responder(channel, child, child_stdin, child_stdout, child_stderr).await?;
        return Ok(code & 0xff);
    }

    if let Some(local_prog) = &cli.local_prog {
        let request = Request::Exec {
            target_domain: resolve_domain_id(&cli.domain),
            cmdline: cli.remote_cmdline.clone(),
        };
        let channel = handshake::connect(&socket_path, request, timeout).await?;

        // `local_prog` takes the terminal's place: its stdout is what it
        // "says" (forwarded to the remote as DATA_STDIN, same as a
        // terminal's stdin would be), and incoming DATA_STDOUT is written
        // to its stdin (what it "hears", same as a terminal displaying
        // remote output). Its stderr is left connected to our own, there
        // being no second local sink for the incoming DATA_STDERR stream.
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(local_prog)
            .env("QREXEC_REMOTE_DOMAIN", &cli.domain)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("spawning the local program")?;
        let child_stdin = child.stdin.take().expect("piped stdin");
        let child_stdout = child.stdout.take().expect("piped stdout");

        let code = pump::run(channel, child_stdout, child_stdin, tokio::io::stderr(), filter).await?;
        return Ok(code & 0xff);
    }

    let request = Request::Exec {
        target_domain: resolve_domain_id(&cli.domain),
        cmdline: cli.remote_cmdline.clone(),
    };
    let channel = handshake::connect(&socket_path, request, timeout).await?;
    let code = pump::run(channel, tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr(), filter).await?;
    Ok(code & 0xff)
}

/// Resolves a `-d domain` argument to a numeric domain id, where possible.
/// Symbolic names (`dom0`, a guest's configured name) are accepted by the
/// socket path lookup alone; the id carried in the wire records falls back
/// to `0` for them, since name-to-id resolution is out of this workspace's
/// scope (spec §1 treats the admin API as an external collaborator).
fn resolve_domain_id(domain: &str) -> i32 {
    domain.parse().unwrap_or(0)
}

/// Matches the daemon's own `qrexec_daemon::socket::SOCKET_DIR` default.
fn default_socket_dir() -> &'static str {
    "/var/run/qubes"
}
