//! Decodes records arriving on the guest agent's control channel and turns
//! them into [`crate::event_loop::Event`]s for the central loop.
//!
//! This is the only place agent-originated bytes are read off the wire;
//! every string field is wrapped in [`qrexec_proto::sanitize::Untrusted`]
//! immediately and never used unsanitised, per spec.md's Design Notes.

use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use qrexec_proto::message::{MsgType, RawTriggerServiceParams};
use qrexec_proto::sanitize::TriggerServiceParams;

use crate::error::Error;
use crate::event_loop::Event;
use crate::port::{DATA_PORT_BASE, DATA_PORT_MAX};

/// Reads and dispatches records arriving on `reader` until the channel
/// closes or a protocol violation occurs.
///
/// `reader` is the read half of the agent control channel, already past
/// `HELLO` (the caller performs the handshake on the full duplex stream
/// before splitting it, since a split half can't itself drive a
/// bidirectional handshake — see `bin/daemon.rs`).
pub async fn run<R: AsyncRead + Unpin>(
    mut reader: R,
    agent_domain: i32,
    events: mpsc::Sender<Event>,
) -> Result<(), Error> {
    tracing::info!(agent_domain, "agent control channel established");

    loop {
        let header = qrexec_proto::read_header(&mut reader).await?;
        let body = qrexec_proto::read_body(&mut reader, header).await?;

        match header.msg_type {
            MsgType::TriggerService => {
                let raw = RawTriggerServiceParams::decode(&body)?;
                let TriggerServiceParams {
                    service_name,
                    target_domain,
                    request_id,
                } = TriggerServiceParams::from_raw(raw);
                tracing::info!(
                    agent_domain,
                    service = %service_name,
                    target = %target_domain,
                    request_id = %request_id,
                    "TRIGGER_SERVICE"
                );
                let _ = events
                    .send(Event::TriggerService {
                        source_domain: agent_domain,
                        request_id,
                        service_name,
                        target_domain,
                    })
                    .await;
            }
            MsgType::ConnectionTerminated => {
                let params = qrexec_proto::ExecParams::decode(&body)?;
                let port = params.connect_port;
                if !(DATA_PORT_BASE..DATA_PORT_MAX).contains(&port) {
                    tracing::warn!(port, "CONNECTION_TERMINATED for a port outside the data range, ignoring");
                } else {
                    let _ = events
                        .send(Event::ClientClosed {
                            port,
                            peer_domain: params.connect_domain,
                        })
                        .await;
                }
            }
            other => {
                // `SERVICE_CONNECT` only ever arrives from a client's data
                // channel (see `crate::connection`), never unprompted on the
                // agent's own control channel — this is a fatal protocol
                // violation here, not a message this loop handles.
                return Err(Error::Protocol(qrexec_proto::Error::ProtocolViolation(format!(
                    "unexpected record {other:?} on agent control channel"
                ))));
            }
        }
    }
}
