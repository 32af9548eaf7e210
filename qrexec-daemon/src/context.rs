//! State shared between per-client connection tasks and the central event
//! loop: the daemon-wide configuration and the single write half of the
//! ctrl-channel, serialised behind a mutex so both sides can forward
//! records onto it without racing each other's writes.

use std::os::fd::RawFd;
use std::sync::Arc;

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;

/// The ctrl-channel's write half, shared by connection tasks (forwarding
/// `EXEC_CMDLINE`/`JUST_EXEC`) and the central loop (forwarding
/// `SERVICE_REFUSED`). A `Mutex` rather than a dedicated writer task is
/// enough here: every write is one already-framed record, so lock hold
/// time is one `write_all` call.
pub type AgentWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Daemon-wide configuration and shared handles, built once at startup and
/// handed by `Arc` to every connection task and the central loop.
#[derive(Debug)]
pub struct DaemonContext {
    /// Default user for this domain, substituted for the `DEFAULT:` keyword.
    pub default_user: Option<String>,
    /// Path to the policy resolver binary to spawn on `TRIGGER_SERVICE`.
    pub policy_binary: String,
    /// Write half of the ctrl-channel to the guest agent.
    pub agent_writer: AgentWriter,
    /// Domain name of the remote end of the ctrl-channel, passed as the
    /// policy resolver's second positional argument (spec §4.6).
    pub remote_domain_name: String,
    /// Raw fd of the ctrl-channel socket, kept only to query its send-space
    /// for the backpressure gate; the channel itself is owned by
    /// `agent_writer` and the paired read half.
    pub agent_ctrl_fd: RawFd,
}

impl DaemonContext {
    /// Bytes of headroom currently available in the ctrl-channel's send
    /// buffer — the source the backpressure gate (spec §4.7, §8 property 4)
    /// samples to decide whether client reads should pause.
    pub fn ctrl_send_space(&self) -> std::io::Result<usize> {
        qrexec_proto::channel::raw_send_space(self.agent_ctrl_fd)
    }
}
