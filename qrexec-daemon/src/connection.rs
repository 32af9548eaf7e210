//! Handles one connection on the daemon's local socket: the `HELLO`
//! handshake, an `EXEC_CMDLINE`/`JUST_EXEC`/`SERVICE_CONNECT` request, and
//! then handing the connection off to [`crate::forward::relay`] once its
//! data port is paired with the agent side.

use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};

use qrexec_proto::message::{ExecParams, MsgType};
use qrexec_proto::sanitize::{sanitize_field, FieldKind, Untrusted};

use crate::client::substitute_default_user;
use crate::context::DaemonContext;
use crate::error::Error;
use crate::event_loop::Event;
use crate::port::{DATA_PORT_BASE, DATA_PORT_MAX};
use crate::rendezvous::Rendezvous;

/// Domain this daemon instance brokers for — the peer on the other side
/// of every client request accepted on the local socket.
#[derive(Debug, Clone, Copy)]
pub struct PeerDomain(pub i32);

/// Runs one client connection to completion: handshake, request decode,
/// registry update, rendezvous, and relay.
pub async fn handle_client(
    mut stream: UnixStream,
    peer_domain: PeerDomain,
    ctx: Arc<DaemonContext>,
    events: mpsc::Sender<Event>,
    rendezvous: Arc<Rendezvous>,
    mut ctrl_gate: watch::Receiver<bool>,
) -> Result<(), Error> {
    qrexec_proto::exchange_hello(&mut stream).await?;

    // Per spec §4.7/§8 property 4, a client is not read from while the
    // ctrl-channel to the agent has no headroom for a forwarded record.
    if ctrl_gate.wait_for(|open| *open).await.is_err() {
        return Err(Error::Io(std::io::Error::other("ctrl-channel gate closed")));
    }

    let header = qrexec_proto::read_header(&mut stream).await?;
    let body = qrexec_proto::read_body(&mut stream, header).await?;

    let port = match header.msg_type {
        MsgType::ExecCmdline | MsgType::JustExec => {
            let (params, raw_cmdline) = qrexec_proto::message::decode_exec_request(&body)?;
            let port = allocate_or_reserve(&events, peer_domain.0, params.connect_port).await?;

            if params.connect_port == 0 {
                // Allocate-for-me (spec §4.3, scenario S1): tell the client
                // which port it was given, over a record of the same type.
                let reply_body = ExecParams {
                    connect_domain: peer_domain.0,
                    connect_port: port,
                }
                .encode();
                qrexec_proto::write_record(&mut stream, header.msg_type, &reply_body).await?;
            }

            let cmdline = substitute_default_user(&raw_cmdline, ctx.default_user.as_deref());
            let forwarded = qrexec_proto::message::encode_exec_request(params.connect_domain, port, &cmdline);
            {
                let mut writer = ctx.agent_writer.lock().await;
                qrexec_proto::write_record(&mut *writer, header.msg_type, &forwarded).await?;
            }

            events
                .send(Event::ClientCmdline {
                    port,
                    cmdline: Some(cmdline),
                })
                .await
                .map_err(|_| Error::Io(std::io::Error::other("event loop gone")))?;
            port
        }
        MsgType::ServiceConnect => {
            let service = qrexec_proto::ServiceParams::decode(&body)?;
            let request_id = sanitize_field(Untrusted::new(&service.ident[..]), FieldKind::RequestId);

            let port = allocate_or_reserve(&events, peer_domain.0, 0).await?;

            let (reply, reply_rx) = oneshot::channel();
            events
                .send(Event::ServiceConnect { request_id, reply })
                .await
                .map_err(|_| Error::Io(std::io::Error::other("event loop gone")))?;
            reply_rx
                .await
                .map_err(|_| Error::Io(std::io::Error::other("event loop dropped reply")))??;
            events
                .send(Event::ClientCmdline { port, cmdline: None })
                .await
                .map_err(|_| Error::Io(std::io::Error::other("event loop gone")))?;
            port
        }
        other => {
            return Err(Error::Protocol(qrexec_proto::Error::ProtocolViolation(format!(
                "unexpected first record {other:?} from client"
            ))));
        }
    };

    let (terminate, terminate_rx) = oneshot::channel();
    events
        .send(Event::ClientRunning { port, terminate })
        .await
        .map_err(|_| Error::Io(std::io::Error::other("event loop gone")))?;

    let result = run_data_channel(port, stream, &rendezvous, terminate_rx).await;

    let _ = events
        .send(Event::ClientClosed {
            port,
            peer_domain: peer_domain.0,
        })
        .await;
    result
}

/// Allocates a fresh port (`requested_port == 0`) or reserves a specific,
/// client-requested one, validating it falls in the legal data-port range
/// first (spec §4.3's "if non-zero, validate that the port is in the legal
/// range").
async fn allocate_or_reserve(
    events: &mpsc::Sender<Event>,
    peer_domain: i32,
    requested_port: u32,
) -> Result<u32, Error> {
    if requested_port == 0 {
        let (reply, reply_rx) = oneshot::channel();
        events
            .send(Event::AllocatePort { peer_domain, reply })
            .await
            .map_err(|_| Error::Io(std::io::Error::other("event loop gone")))?;
        reply_rx
            .await
            .map_err(|_| Error::Io(std::io::Error::other("event loop dropped reply")))?
    } else {
        if !(DATA_PORT_BASE..DATA_PORT_MAX).contains(&requested_port) {
            return Err(Error::PortSpaceExhausted);
        }
        let (reply, reply_rx) = oneshot::channel();
        events
            .send(Event::ReservePort {
                port: requested_port,
                peer_domain,
                reply,
            })
            .await
            .map_err(|_| Error::Io(std::io::Error::other("event loop gone")))?;
        reply_rx
            .await
            .map_err(|_| Error::Io(std::io::Error::other("event loop dropped reply")))??;
        Ok(requested_port)
    }
}

/// Waits for this port's data-channel peer and relays, racing that wait (and
/// the relay itself) against `terminate_rx` — fired by the central loop on a
/// domain-matched `CONNECTION_TERMINATED`, our notify-on-close signal (spec
/// §3, §4.3, §8 property 1).
async fn run_data_channel(
    port: u32,
    stream: UnixStream,
    rendezvous: &Rendezvous,
    terminate_rx: oneshot::Receiver<()>,
) -> Result<(), Error> {
    let Some((own, peer_rx)) = rendezvous.join(port, stream) else {
        return Ok(());
    };

    let work = async {
        match peer_rx.await {
            Ok(peer_stream) => crate::forward::relay(own, peer_stream).await,
            Err(_) => {
                rendezvous.cancel(port);
                Ok(())
            }
        }
    };

    tokio::select! {
        result = work => result,
        _ = terminate_rx => {
            rendezvous.cancel(port);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop;

    fn spawn_event_loop() -> (mpsc::Sender<Event>, tokio::task::JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_bp_tx, bp_rx) = watch::channel(true);
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let stream = UnixStream::from_std(a).unwrap();
        let (_read, write) = stream.into_split();
        let ctx = Arc::new(DaemonContext {
            default_user: None,
            policy_binary: "true".to_owned(),
            agent_writer: Arc::new(tokio::sync::Mutex::new(write)),
            remote_domain_name: "sys-net".to_owned(),
            agent_ctrl_fd: -1,
        });
        let handle = tokio::spawn(event_loop::run(ctx, events_rx, bp_rx));
        (events_tx, handle)
    }

    #[tokio::test]
    async fn allocate_or_reserve_allocates_a_fresh_port_for_zero() {
        let (events_tx, handle) = spawn_event_loop();
        let port = allocate_or_reserve(&events_tx, 4, 0).await.unwrap();
        assert!((DATA_PORT_BASE..DATA_PORT_MAX).contains(&port));
        drop(events_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn allocate_or_reserve_reserves_the_exact_requested_port() {
        let (events_tx, handle) = spawn_event_loop();
        let port = allocate_or_reserve(&events_tx, 4, 600).await.unwrap();
        assert_eq!(port, 600);
        drop(events_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn allocate_or_reserve_rejects_a_connect_port_outside_the_data_range() {
        let (events_tx, handle) = spawn_event_loop();
        let err = allocate_or_reserve(&events_tx, 4, 5).await.unwrap_err();
        assert!(matches!(err, Error::PortSpaceExhausted));
        drop(events_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn a_zero_connect_port_gets_a_write_back_reply_with_the_allocated_port() {
        let (events_tx, handle) = spawn_event_loop();
        let (client, daemon_side) = tokio::net::UnixStream::pair().unwrap();
        let mut client = client;

        let rendezvous = Arc::new(Rendezvous::new());
        let ctx = Arc::new(DaemonContext {
            default_user: None,
            policy_binary: "true".to_owned(),
            agent_writer: {
                let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
                a.set_nonblocking(true).unwrap();
                let stream = UnixStream::from_std(a).unwrap();
                let (_read, write) = stream.into_split();
                Arc::new(tokio::sync::Mutex::new(write))
            },
            remote_domain_name: "sys-net".to_owned(),
            agent_ctrl_fd: -1,
        });
        let (_bp_tx, ctrl_gate) = watch::channel(true);

        let conn_task = tokio::spawn(handle_client(
            daemon_side,
            PeerDomain(4),
            ctx,
            events_tx,
            rendezvous,
            ctrl_gate,
        ));

        qrexec_proto::exchange_hello(&mut client).await.unwrap();
        let body = qrexec_proto::message::encode_exec_request(4, 0, "user:echo hi");
        qrexec_proto::write_record(&mut client, MsgType::ExecCmdline, &body)
            .await
            .unwrap();

        let header = qrexec_proto::read_header(&mut client).await.unwrap();
        assert_eq!(header.msg_type, MsgType::ExecCmdline);
        let reply_body = qrexec_proto::read_body(&mut client, header).await.unwrap();
        let reply = ExecParams::decode(&reply_body).unwrap();
        assert_eq!(reply.connect_domain, 4);
        assert!((DATA_PORT_BASE..DATA_PORT_MAX).contains(&reply.connect_port));

        conn_task.abort();
        let _ = conn_task.await;
        handle.abort();
        let _ = handle.await;
    }
}
