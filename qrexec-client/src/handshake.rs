//! Dialling the daemon's local socket and completing the handshake.
//!
//! Grounded in `qrexec-client.c`'s `main`/`negotiate_connection_params`:
//! connect, exchange `HELLO`, then send the exec/just-exec/service-connect
//! request record. In this transport the same connection then becomes the
//! data channel the I/O pump runs over, in place of the original's
//! separate `libvchan_client_init` step over the allocated port.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;

use qrexec_proto::message::{encode_exec_request, ExecParams, MsgType, ServiceParams};

use crate::error::Error;

/// What kind of request this connection is opening.
#[derive(Debug, Clone)]
pub enum Request {
    /// Run a command in `target_domain` with stdio piped through (the
    /// default role; no `-l`/`-c`/`-e` given).
    Exec {
        /// Domain the command should run in.
        target_domain: i32,
        /// Command line to run, e.g. `user:/bin/sh -c 'echo hi'`.
        cmdline: String,
    },
    /// Run a command in `target_domain` without piping stdio (`-e`).
    JustExec {
        /// Domain the command should run in.
        target_domain: i32,
        /// Command line to run.
        cmdline: String,
    },
    /// Join an existing service call by request identifier — the `-l`/`-c`
    /// disposable-service-answering role.
    ServiceConnect {
        /// Request identifier to answer, as handed out in the trigger.
        request_id: String,
    },
}

/// Connects to the daemon's local socket, completes the `HELLO` handshake,
/// and sends `request`. Returns the same stream, now usable as the data
/// channel for [`crate::pump::run`].
///
/// Fails with [`Error::ConnectTimeout`] if the whole sequence does not
/// complete within `timeout`; a zero `timeout` disables the deadline
/// (spec §6's `-w timeout`, default 5s).
pub async fn connect(socket_path: &Path, request: Request, timeout: Duration) -> Result<UnixStream, Error> {
    let sequence = dial_and_handshake(socket_path, request);
    if timeout.is_zero() {
        return sequence.await;
    }
    match tokio::time::timeout(timeout, sequence).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout(timeout)),
    }
}

async fn dial_and_handshake(socket_path: &Path, request: Request) -> Result<UnixStream, Error> {
    let mut stream = UnixStream::connect(socket_path).await?;
    qrexec_proto::exchange_hello(&mut stream).await?;

    match request {
        Request::Exec { target_domain, cmdline } => {
            let body = encode_exec_request(target_domain, 0, &cmdline);
            qrexec_proto::write_record(&mut stream, MsgType::ExecCmdline, &body).await?;
            read_allocated_port(&mut stream, MsgType::ExecCmdline).await?;
        }
        Request::JustExec { target_domain, cmdline } => {
            let body = encode_exec_request(target_domain, 0, &cmdline);
            qrexec_proto::write_record(&mut stream, MsgType::JustExec, &body).await?;
            read_allocated_port(&mut stream, MsgType::JustExec).await?;
        }
        Request::ServiceConnect { request_id } => {
            let body = ServiceParams::from_str(&request_id).encode();
            qrexec_proto::write_record(&mut stream, MsgType::ServiceConnect, &body).await?;
        }
    }

    Ok(stream)
}

/// Reads the daemon's write-back reply to a `connect_port == 0` request:
/// a record of the same type carrying the port the daemon allocated and its
/// own remote-domain id (spec §4.3). The data channel proper starts only
/// after this record is consumed off the stream.
async fn read_allocated_port(stream: &mut UnixStream, expected_type: MsgType) -> Result<(), Error> {
    let header = qrexec_proto::read_header(stream).await?;
    if header.msg_type != expected_type {
        return Err(qrexec_proto::Error::ProtocolViolation(format!(
            "expected {expected_type:?} port reply, got {:?}",
            header.msg_type
        ))
        .into());
    }
    let body = qrexec_proto::read_body(stream, header).await?;
    ExecParams::decode(&body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrexec_proto::message::{decode_exec_request, Header};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn exec_request_reaches_the_daemon_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qrexec.test");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            qrexec_proto::exchange_hello(&mut peer).await.unwrap();
            let header = qrexec_proto::read_header(&mut peer).await.unwrap();
            let body = qrexec_proto::read_body(&mut peer, header).await.unwrap();
            let reply = ExecParams {
                connect_domain: 4,
                connect_port: 513,
            }
            .encode();
            qrexec_proto::write_record(&mut peer, MsgType::ExecCmdline, &reply)
                .await
                .unwrap();
            (header.msg_type, decode_exec_request(&body).unwrap())
        });

        let _stream = connect(
            &path,
            Request::Exec {
                target_domain: 4,
                cmdline: "user:echo hi".to_owned(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let (msg_type, (params, cmdline)) = server.await.unwrap();
        assert_eq!(msg_type, MsgType::ExecCmdline);
        assert_eq!(params.connect_domain, 4);
        assert_eq!(params.connect_port, 0);
        assert_eq!(cmdline, "user:echo hi");
    }

    #[tokio::test]
    async fn service_connect_sends_the_request_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qrexec.test");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            qrexec_proto::exchange_hello(&mut peer).await.unwrap();
            let header = qrexec_proto::read_header(&mut peer).await.unwrap();
            let body = qrexec_proto::read_body(&mut peer, header).await.unwrap();
            (header, ServiceParams::decode(&body).unwrap())
        });

        let _stream = connect(
            &path,
            Request::ServiceConnect {
                request_id: "req-1".to_owned(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let (header, params) = server.await.unwrap();
        assert_eq!(header.msg_type, MsgType::ServiceConnect);
        assert_eq!(params.as_str(), "req-1");
        let _ = Header::WIRE_LEN;
    }

    #[tokio::test]
    async fn a_peer_that_never_accepts_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qrexec.nobody-home");
        // Bind but never accept, so the handshake after connect() hangs.
        let listener = UnixListener::bind(&path).unwrap();
        std::mem::forget(listener);

        let err = connect(
            &path,
            Request::Exec {
                target_domain: 1,
                cmdline: "user:true".to_owned(),
            },
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout(_)));
    }
}
