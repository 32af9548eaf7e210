//! The daemon's single-threaded central loop: the only task that ever
//! touches [`ClientRegistry`] or [`PendingTriggerTable`].
//!
//! Per-connection tasks (spawned in `bin/daemon.rs`) are dumb decoders:
//! they read records off their socket, turn them into an [`Event`], and
//! send it here. This is the idiomatic-async reinterpretation of the
//! original's `select()`-driven event loop with global mutable tables —
//! spec §5 asks for "no locks required" and "no data-plane thread runs in
//! parallel with the main loop"; here that invariant holds because exactly
//! one task ever owns `DaemonState`, the same way `bux-guest/src/server.rs`
//! has each connection task forward decoded requests rather than share
//! state directly.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use qrexec_proto::sanitize::Sanitized;

use crate::context::DaemonContext;
use crate::error::Error;
use crate::policy::{self, PendingTrigger, PendingTriggerTable, PolicyResult};
use crate::registry::ClientRegistry;

/// Everything a per-connection task can ask the central loop to do.
#[derive(Debug)]
pub enum Event {
    /// A new client connection completed `HELLO` and needs the lowest free
    /// data port allocated for it.
    AllocatePort {
        /// Domain the client's request concerns.
        peer_domain: i32,
        /// Where to send the allocated port back to the connection task.
        reply: oneshot::Sender<Result<u32, Error>>,
    },
    /// A new client connection asked for a specific `connect_port != 0`
    /// (spec §4.3's allocate-for-peer case).
    ReservePort {
        /// The specific port the client is requesting.
        port: u32,
        /// Domain the client's request concerns.
        peer_domain: i32,
        /// Where to send the outcome back to the connection task.
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// A client sent `EXEC_CMDLINE`/`JUST_EXEC`, already forwarded to the
    /// agent by the caller (spec §4.4: forwarding is connection-local I/O,
    /// not central-loop bookkeeping).
    ClientCmdline {
        /// The client's data port.
        port: u32,
        /// The forwarded command line, after `DEFAULT:` substitution.
        cmdline: Option<String>,
    },
    /// A client's data channel is now paired with a peer and forwarding.
    /// `terminate` is the connection task's half of a notify-on-close
    /// signal: firing it asks that task to stop forwarding and close,
    /// without the registry ever touching the socket itself.
    ClientRunning {
        /// The client's data port.
        port: u32,
        /// Signalled by [`Event::ClientClosed`] on a domain-matched remove.
        terminate: oneshot::Sender<()>,
    },
    /// A client connection ended; its port is released — but only if
    /// `peer_domain` matches the domain the port was allocated for (spec
    /// §4.3, §8 property 1).
    ClientClosed {
        /// The client's data port.
        port: u32,
        /// Domain the closing side claims to be.
        peer_domain: i32,
    },
    /// An agent reported `TRIGGER_SERVICE`: dispatch policy evaluation.
    TriggerService {
        /// Domain that sent the trigger.
        source_domain: i32,
        /// Request identifier correlating this trigger with a later
        /// `SERVICE_CONNECT`.
        request_id: Sanitized,
        /// Requested service name.
        service_name: Sanitized,
        /// Requested target domain name or alias.
        target_domain: Sanitized,
    },
    /// A policy resolver process exited; its verdict is ready.
    PolicyDone(PolicyResult),
    /// A client sent `SERVICE_CONNECT`: look up and clear the matching
    /// pending trigger.
    ServiceConnect {
        /// Request identifier the client is answering.
        request_id: Sanitized,
        /// Where to send the resolved trigger (or an error) back.
        reply: oneshot::Sender<Result<PendingTrigger, Error>>,
    },
}

/// Runs the central loop until `events` closes (every sender dropped).
///
/// `backpressure` is a `watch` channel the loop never writes to directly —
/// per-connection tasks update it from their own `Channel::send_space()`
/// readings; it is threaded through here only so it can be handed to the
/// policy/trigger bookkeeping that needs to read current gate state when
/// deciding whether a newly-paired connection may start forwarding
/// immediately.
pub async fn run(ctx: Arc<DaemonContext>, mut events: mpsc::Receiver<Event>, backpressure: watch::Receiver<bool>) {
    let mut registry = ClientRegistry::new();
    let mut triggers = PendingTriggerTable::new();
    let (policy_tx, mut policy_rx) = mpsc::channel(16);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("event channel closed, central loop exiting");
                    break;
                };
                handle_event(event, &ctx, &mut registry, &mut triggers, &policy_tx, &backpressure).await;
            }
            Some(result) = policy_rx.recv() => {
                handle_event(Event::PolicyDone(result), &ctx, &mut registry, &mut triggers, &policy_tx, &backpressure).await;
            }
        }
    }
}

async fn handle_event(
    event: Event,
    ctx: &Arc<DaemonContext>,
    registry: &mut ClientRegistry,
    triggers: &mut PendingTriggerTable,
    policy_tx: &mpsc::Sender<PolicyResult>,
    backpressure: &watch::Receiver<bool>,
) {
    match event {
        Event::AllocatePort { peer_domain, reply } => {
            let result = registry.register(peer_domain);
            if let Ok(port) = &result {
                tracing::info!(port, peer_domain, "client registered");
            }
            let _ = reply.send(result);
        }
        Event::ReservePort { port, peer_domain, reply } => {
            let result = registry.register_on_port(port, peer_domain);
            if result.is_ok() {
                tracing::info!(port, peer_domain, "client registered on requested port");
            }
            let _ = reply.send(result);
        }
        Event::ClientCmdline { port, cmdline } => {
            if let Some(entry) = registry.get_mut(port) {
                if let Err(e) = entry.begin_cmdline(cmdline) {
                    tracing::warn!(port, error = %e, "rejected out-of-order CMDLINE");
                }
            }
        }
        Event::ClientRunning { port, terminate } => {
            if let Some(entry) = registry.get_mut(port) {
                if let Err(e) = entry.mark_running() {
                    tracing::warn!(port, error = %e, "rejected out-of-order RUNNING transition");
                }
            }
            registry.set_notify(port, terminate);
            let allowed = *backpressure.borrow();
            tracing::debug!(port, send_space_open = allowed, "client running");
        }
        Event::ClientClosed { port, peer_domain } => {
            registry.remove(port, peer_domain);
            tracing::info!(port, peer_domain, "client connection closed");
        }
        Event::TriggerService {
            source_domain,
            request_id,
            service_name,
            target_domain,
        } => {
            let request_id_str = request_id.as_str().to_owned();
            triggers.insert(
                request_id,
                PendingTrigger {
                    source_domain,
                    service_name: service_name.clone(),
                    target_domain: target_domain.clone(),
                },
            );
            if let Err(e) = policy::dispatch(
                &ctx.policy_binary,
                request_id_str,
                source_domain,
                &ctx.remote_domain_name,
                target_domain.as_str(),
                service_name.as_str(),
                policy_tx.clone(),
            ) {
                tracing::error!(error = %e, "failed to spawn policy resolver");
            }
        }
        Event::PolicyDone(result) => {
            if result.allowed {
                tracing::debug!(request_id = %result.request_id, "policy allowed, awaiting SERVICE_CONNECT");
                return;
            }
            triggers.remove_str(&result.request_id);
            tracing::info!(request_id = %result.request_id, "policy denied, sending SERVICE_REFUSED");
            let body = qrexec_proto::ServiceParams::from_str(&result.request_id).encode();
            let mut writer = ctx.agent_writer.lock().await;
            if let Err(e) = qrexec_proto::write_record(&mut *writer, qrexec_proto::MsgType::ServiceRefused, &body).await
            {
                tracing::error!(error = %e, "failed to send SERVICE_REFUSED to agent");
            }
        }
        Event::ServiceConnect { request_id, reply } => {
            let _ = reply.send(triggers.take(&request_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hello_then_cmdline_then_running_round_trips() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_bp_tx, bp_rx) = watch::channel(true);
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let stream = tokio::net::UnixStream::from_std(a).unwrap();
        let (_read, write) = stream.into_split();
        let ctx = Arc::new(DaemonContext {
            default_user: Some("alice".to_owned()),
            policy_binary: "true".to_owned(),
            agent_writer: Arc::new(tokio::sync::Mutex::new(write)),
            remote_domain_name: "sys-net".to_owned(),
            agent_ctrl_fd: -1,
        });
        let handle = tokio::spawn(run(ctx, events_rx, bp_rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        events_tx
            .send(Event::AllocatePort {
                peer_domain: 4,
                reply: reply_tx,
            })
            .await
            .unwrap();
        let port = reply_rx.await.unwrap().unwrap();

        events_tx
            .send(Event::ClientCmdline {
                port,
                cmdline: Some("user:echo hi".to_owned()),
            })
            .await
            .unwrap();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        events_tx
            .send(Event::ClientRunning { port, terminate: terminate_tx })
            .await
            .unwrap();
        events_tx
            .send(Event::ClientClosed { port, peer_domain: 4 })
            .await
            .unwrap();
        assert!(terminate_rx.await.is_ok());

        drop(events_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn trigger_then_service_connect_resolves_the_pending_trigger() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_bp_tx, bp_rx) = watch::channel(true);
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let stream = tokio::net::UnixStream::from_std(a).unwrap();
        let (_read, write) = stream.into_split();
        let ctx = Arc::new(DaemonContext {
            default_user: None,
            policy_binary: "true".to_owned(),
            agent_writer: Arc::new(tokio::sync::Mutex::new(write)),
            remote_domain_name: "sys-net".to_owned(),
            agent_ctrl_fd: -1,
        });
        let handle = tokio::spawn(run(ctx, events_rx, bp_rx));

        let request_id = sanitized("req-1");
        events_tx
            .send(Event::TriggerService {
                source_domain: 2,
                request_id: request_id.clone(),
                service_name: sanitized("qubes.Filecopy"),
                target_domain: sanitized("@default"),
            })
            .await
            .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        events_tx
            .send(Event::ServiceConnect {
                request_id,
                reply: reply_tx,
            })
            .await
            .unwrap();
        let trigger = reply_rx.await.unwrap().unwrap();
        assert_eq!(trigger.source_domain, 2);

        drop(events_tx);
        handle.await.unwrap();
    }

    fn sanitized(s: &str) -> Sanitized {
        use qrexec_proto::sanitize::{sanitize_field, FieldKind, Untrusted};
        let mut buf = vec![0u8; s.len() + 1];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        sanitize_field(Untrusted::new(&buf[..]), FieldKind::ServiceName)
    }
}
