//! Per-connection client state machine.
//!
//! A "client" here is anything connected to the daemon's local socket:
//! `qrexec-client`, or a disposable VM joining a triggered service. Each
//! one owns exactly one data port for its lifetime. Grounded in
//! `qrexec-daemon.c`'s `client_info` struct and its `connection_state`
//! transitions (`CLIENT_INVALID` → `CLIENT_CMDLINE` → `CLIENT_RUNNING`).

use crate::error::Error;

/// Lifecycle state of one client connection, in the order spec.md's
/// Design Notes describe: a fresh connection starts at `Hello`, moves to
/// `Cmdline` once it has sent an exec/service request, to `Running` once
/// the daemon has paired it with a data channel, and to `Invalid` once
/// torn down (kept around briefly so a late, racing message gets a clean
/// rejection instead of a dangling port lookup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, `HELLO` exchanged, no request sent yet.
    Hello,
    /// Sent an `EXEC_CMDLINE`/`JUST_EXEC`/`TRIGGER_SERVICE` request, not
    /// yet paired with a peer.
    Cmdline,
    /// Paired with a peer; its data port is forwarding stdio.
    Running,
    /// Torn down. Retained only long enough to answer late messages.
    Invalid,
}

/// One entry in the daemon's client registry.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    /// Data port this client owns for the lifetime of the connection.
    pub port: u32,
    /// Domain id of the peer this client's request concerns.
    pub peer_domain: i32,
    /// The forwarded `EXEC_CMDLINE`/`JUST_EXEC` command line, after
    /// `DEFAULT:` substitution, if this client sent one.
    pub cmdline: Option<String>,
    /// Current lifecycle state.
    pub state: ClientState,
}

impl ClientEntry {
    /// Builds a fresh entry immediately after `HELLO`, owning `port`.
    #[must_use]
    pub fn new(port: u32, peer_domain: i32) -> Self {
        Self {
            port,
            peer_domain,
            cmdline: None,
            state: ClientState::Hello,
        }
    }

    /// Advances `Hello` → `Cmdline`, recording the forwarded command line.
    pub fn begin_cmdline(&mut self, cmdline: Option<String>) -> Result<(), Error> {
        if self.state != ClientState::Hello {
            return Err(Error::InvalidClientState {
                port: self.port,
                state: self.state,
            });
        }
        self.cmdline = cmdline;
        self.state = ClientState::Cmdline;
        Ok(())
    }

    /// Advances `Cmdline` → `Running`, once the daemon has a peer ready.
    pub fn mark_running(&mut self) -> Result<(), Error> {
        if self.state != ClientState::Cmdline {
            return Err(Error::InvalidClientState {
                port: self.port,
                state: self.state,
            });
        }
        self.state = ClientState::Running;
        Ok(())
    }

    /// Marks this entry torn down. Idempotent.
    pub fn invalidate(&mut self) {
        self.state = ClientState::Invalid;
    }
}

/// Resolves the `DEFAULT:` keyword substitution `qrexec-daemon.c` applies
/// to a forwarded command line (spec §4.4): if `cmdline` begins with the
/// literal prefix `DEFAULT:`, that prefix is replaced by `default_user`
/// followed by a colon before forwarding; any other command line passes
/// through unchanged. With no configured default user, a `DEFAULT:`
/// command line is left as-is — there is nothing to substitute it with.
#[must_use]
pub fn substitute_default_user(cmdline: &str, default_user: Option<&str>) -> String {
    const KEYWORD: &str = "DEFAULT:";
    match (cmdline.strip_prefix(KEYWORD), default_user) {
        (Some(rest), Some(user)) => format!("{user}:{rest}"),
        _ => cmdline.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_rejects_out_of_order_transitions() {
        let mut client = ClientEntry::new(600, 2);
        assert!(client.mark_running().is_err());
        client.begin_cmdline(None).unwrap();
        assert!(client.begin_cmdline(None).is_err());
        client.mark_running().unwrap();
        assert_eq!(client.state, ClientState::Running);
    }

    #[test]
    fn default_keyword_prefix_substitutes_configured_user() {
        assert_eq!(
            substitute_default_user("DEFAULT:echo hi", Some("user")),
            "user:echo hi"
        );
    }

    #[test]
    fn default_keyword_with_no_configured_user_passes_through() {
        assert_eq!(
            substitute_default_user("DEFAULT:echo hi", None),
            "DEFAULT:echo hi"
        );
    }

    #[test]
    fn explicit_user_passes_through_unchanged() {
        assert_eq!(substitute_default_user("bob:ls", Some("alice")), "bob:ls");
    }
}
