//! Bidirectional relay between two paired data channels.
//!
//! The daemon does not interpret stdio itself on the host side of a data
//! channel — it relays whatever `DATA_STDIN`/`DATA_STDOUT`/`DATA_STDERR`/
//! `DATA_EXIT_CODE` records one peer sends to the other, opaque. This
//! mirrors the original's `handle_data_wait` model, where the daemon is a
//! dumb byte relay and interpretation (the `-t`/`-T` filter, the exit-code
//! handling) lives entirely in `qrexec-client`. The backpressure gate that
//! spec §8's property 4 asks for is sourced from the ctrl-channel, not from
//! these data-channel peers — see `crate::connection`'s use of
//! `DaemonContext::ctrl_send_space` — so this relay has nothing to do with
//! gating client reads; it only forwards.
//!
//! Each direction runs in its own task; a reader and a writer in the same
//! direction are never aliased, so the two directions share their
//! channels only through a `Mutex` guarding the half each task doesn't
//! own.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use qrexec_proto::channel::Channel;
use qrexec_proto::message::MsgType;

use crate::error::Error;

/// Relays records between `a` and `b` until a `DATA_EXIT_CODE` passes in
/// either direction, or until one side's read ends at a clean frame
/// boundary.
pub async fn relay<A, B>(a: A, b: B) -> Result<(), Error>
where
    A: Channel + 'static,
    B: Channel + 'static,
{
    let a = Arc::new(Mutex::new(a));
    let b = Arc::new(Mutex::new(b));

    let forward_a_to_b: JoinHandle<Result<(), Error>> = {
        let (a, b) = (Arc::clone(&a), Arc::clone(&b));
        tokio::spawn(async move { pump(a, b).await })
    };
    let forward_b_to_a: JoinHandle<Result<(), Error>> = {
        let (a, b) = (Arc::clone(&a), Arc::clone(&b));
        tokio::spawn(async move { pump(b, a).await })
    };

    // The data channel is done as soon as either direction finishes —
    // normally because a `DATA_EXIT_CODE` passed, but also on a read
    // error or an unexpected close. The still-running direction is
    // aborted rather than waited on, since its peer has nothing left to
    // say once the other side has wound down.
    let result = tokio::select! {
        r = forward_a_to_b => {
            forward_b_to_a.abort();
            r
        }
        r = forward_b_to_a => {
            forward_a_to_b.abort();
            r
        }
    };
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::Io(std::io::Error::other(e))),
    }
}

/// Forwards records from `from` to `to` until a `DATA_EXIT_CODE` passes or
/// the read side closes cleanly at a frame boundary. A clean close ends the
/// relay the same way a `DATA_EXIT_CODE` does — it is ordinary teardown,
/// not a failure, and must not be reported as one.
async fn pump<F: Channel, T: Channel>(from: Arc<Mutex<F>>, to: Arc<Mutex<T>>) -> Result<(), Error> {
    loop {
        let (header, body) = {
            let mut from = from.lock().await;
            let header = match qrexec_proto::read_header(&mut *from).await {
                Ok(header) => header,
                Err(qrexec_proto::Error::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let body = qrexec_proto::read_body(&mut *from, header).await?;
            (header, body)
        };

        {
            let mut to = to.lock().await;
            qrexec_proto::write_record(&mut *to, header.msg_type, &body).await?;
        }

        if header.msg_type == MsgType::DataExitCode {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrexec_proto::channel::test_util;

    #[tokio::test]
    async fn relays_a_chunk_and_stops_at_exit_code() {
        let (mut client, daemon_side_client) = test_util::pair(256);
        let (mut agent, daemon_side_agent) = test_util::pair(256);

        let relay_task = tokio::spawn(relay(daemon_side_client, daemon_side_agent));

        qrexec_proto::write_record(&mut client, MsgType::DataStdin, b"hello")
            .await
            .unwrap();
        let header = qrexec_proto::read_header(&mut agent).await.unwrap();
        assert_eq!(header.msg_type, MsgType::DataStdin);
        let body = qrexec_proto::read_body(&mut agent, header).await.unwrap();
        assert_eq!(body, b"hello");

        qrexec_proto::write_record(&mut agent, MsgType::DataExitCode, &0i32.to_le_bytes())
            .await
            .unwrap();
        let header = qrexec_proto::read_header(&mut client).await.unwrap();
        assert_eq!(header.msg_type, MsgType::DataExitCode);

        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn a_clean_close_without_exit_code_ends_the_relay_without_error() {
        let (client, daemon_side_client) = test_util::pair(256);
        let (agent, daemon_side_agent) = test_util::pair(256);

        let relay_task = tokio::spawn(relay(daemon_side_client, daemon_side_agent));

        drop(client);
        drop(agent);

        relay_task.await.unwrap().unwrap();
    }
}
