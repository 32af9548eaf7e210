//! `qrexec-daemon` — host-side broker for one guest domain.
//!
//! ```text
//! qrexec-daemon [-q] domid domain-name [default-user]
//! ```
//!
//! Matches `qrexec-daemon.c`'s CLI and startup sequence: a double-fork so
//! the caller (typically `libvirt`/`xl`) sees a clean exit once the daemon
//! is actually ready to serve requests, not merely spawned.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};

use qrexec_daemon::connection::{handle_client, PeerDomain};
use qrexec_daemon::context::DaemonContext;
use qrexec_daemon::event_loop;
use qrexec_daemon::rendezvous::Rendezvous;
use qrexec_daemon::socket::SocketPaths;
use qrexec_daemon::startup;

/// Host-side qrexec broker for one guest domain.
#[derive(Debug, Parser)]
#[command(name = "qrexec-daemon")]
struct Cli {
    /// Suppress the startup banner on stderr.
    #[arg(short = 'q')]
    quiet: bool,

    /// Numeric domain id of the guest this daemon brokers for.
    domid: u32,

    /// Domain name, used to name the local socket and log file.
    domain_name: String,

    /// User to substitute for the `DEFAULT:` keyword in exec requests.
    default_user: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if startup::startup_nowait() {
        return run_daemon(cli, None);
    }

    if !cli.quiet {
        eprint!("Waiting for VM's qrexec agent.....");
    }

    // SAFETY: called before any threads exist — main() has not yet built
    // a tokio runtime.
    match unsafe { startup::double_fork(startup::startup_timeout()) } {
        startup::Outcome::Parent { exit_code } => {
            if !cli.quiet {
                eprintln!("{}", if exit_code == 0 { " ok" } else { " failed" });
            }
            std::process::exit(exit_code);
        }
        startup::Outcome::Child { parent_pid } => run_daemon(cli, Some(parent_pid)),
    }
}

fn run_daemon(cli: Cli, ready_parent: Option<libc::pid_t>) -> anyhow::Result<()> {
    init_logging(&cli.domain_name)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the daemon's single-threaded runtime")?;

    runtime.block_on(async_main(cli, ready_parent))
}

fn init_logging(domain_name: &str) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let log_dir = PathBuf::from("/var/log/qubes");
    std::fs::create_dir_all(&log_dir).ok();
    let log_path = log_dir.join(format!("qrexec.{domain_name}.log"));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    if let Ok(file) = &file {
        set_log_permissions(file, &log_path);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match file {
        Ok(file) => subscriber.with_writer(file).init(),
        Err(_) => subscriber.init(),
    }
    Ok(())
}

/// Matches spec §6: the per-guest log file is group-readable (0660) under
/// the `qubes` group, so other members of that group (e.g. a GUI daemon
/// presenting error dialogs) can tail it without running as root.
fn set_log_permissions(file: &std::fs::File, path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = file.set_permissions(std::fs::Permissions::from_mode(0o660)) {
        tracing::warn!(error = %e, path = %path.display(), "failed to set log file mode");
    }
    if let Some(group) = nix::unistd::Group::from_name("qubes").ok().flatten() {
        if let Err(e) = nix::unistd::chown(path, None, Some(group.gid)) {
            tracing::warn!(error = %e, path = %path.display(), "failed to set log file group");
        }
    }
}

async fn async_main(cli: Cli, ready_parent: Option<libc::pid_t>) -> anyhow::Result<()> {
    let socket_dir = std::env::var("QREXEC_SOCKET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(qrexec_daemon::socket::SOCKET_DIR));
    let paths = SocketPaths::new(&socket_dir, cli.domid, &cli.domain_name);
    let listener = paths.bind().context("binding the local client socket")?;
    tracing::info!(socket = %paths.socket.display(), alias = %paths.alias.display(), "listening");

    let agent_socket = std::env::var("QREXEC_AGENT_SOCKET")
        .unwrap_or_else(|_| format!("/var/run/qubes/qrexec-agent.{}.sock", cli.domid));
    let mut agent_stream = connect_to_agent(&agent_socket, startup::startup_timeout()).await?;

    // The handshake needs both directions, so it runs on the full duplex
    // stream before it's split; a split half can't drive a bidirectional
    // exchange on its own.
    qrexec_proto::exchange_hello(&mut agent_stream)
        .await
        .context("exchanging HELLO with the guest agent")?;
    let agent_ctrl_fd = agent_stream.as_raw_fd();
    let (agent_read, agent_write) = agent_stream.into_split();

    if let Some(parent_pid) = ready_parent {
        // SAFETY: `parent_pid` is the ancestor `double_fork` recorded
        // before detaching; still valid as long as it hasn't exited,
        // which is exactly the condition being signalled here.
        unsafe { startup::signal_ready(parent_pid) };
    }

    let (events_tx, events_rx) = mpsc::channel(256);
    let (ctrl_gate_tx, ctrl_gate_rx) = watch::channel(true);
    let rendezvous = Arc::new(Rendezvous::new());

    let ctx = Arc::new(DaemonContext {
        default_user: cli.default_user,
        policy_binary: std::env::var("QREXEC_POLICY_BINARY").unwrap_or_else(|_| "qrexec-policy-exec".to_owned()),
        agent_writer: Arc::new(tokio::sync::Mutex::new(agent_write)),
        remote_domain_name: cli.domain_name.clone(),
        agent_ctrl_fd,
    });

    tokio::spawn(event_loop::run(Arc::clone(&ctx), events_rx, ctrl_gate_rx.clone()));

    // Samples the ctrl-channel's real send-buffer headroom and flips the
    // gate every client read loop waits on (spec §4.7, §8 property 4) —
    // the backpressure source is the ctrl-channel, not any data-channel peer.
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            loop {
                let open = ctx
                    .ctrl_send_space()
                    .map(|space| space >= qrexec_proto::message::Header::WIRE_LEN)
                    .unwrap_or(true);
                ctrl_gate_tx.send_if_modified(|current| {
                    if *current == open {
                        false
                    } else {
                        *current = open;
                        true
                    }
                });
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
    }

    {
        let events_tx = events_tx.clone();
        let domid = i32::try_from(cli.domid).unwrap_or(i32::MAX);
        tokio::spawn(async move {
            if let Err(e) = qrexec_daemon::agent::run(agent_read, domid, events_tx).await {
                tracing::error!(error = %e, "agent control channel ended");
            }
        });
    }

    loop {
        let (stream, _addr) = listener.accept().await.context("accepting a client connection")?;
        let events_tx = events_tx.clone();
        let ctx = Arc::clone(&ctx);
        let rendezvous = Arc::clone(&rendezvous);
        let ctrl_gate_rx = ctrl_gate_rx.clone();
        let peer_domain = PeerDomain(i32::try_from(cli.domid).unwrap_or(i32::MAX));
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer_domain, ctx, events_tx, rendezvous, ctrl_gate_rx).await {
                tracing::warn!(error = %e, "client connection ended with an error");
            }
        });
    }
}

async fn connect_to_agent(path: &str, timeout: Duration) -> anyhow::Result<tokio::net::UnixStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::net::UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::debug!(error = %e, path, "agent not ready yet, retrying");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => return Err(e).context("connecting to the guest agent's control channel"),
        }
    }
}
