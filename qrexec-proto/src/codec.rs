//! Async read/write helpers for framing [`Header`] + body records on top of
//! any `AsyncRead`/`AsyncWrite` byte stream.
//!
//! The shape mirrors the teacher's `bux-proto::codec` send/recv functions —
//! a header read, a length-bounded body read, one `BufWriter`-free write —
//! but the encoding itself is fixed-width rather than postcard, per spec §4.1.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Header, MsgType, PROTOCOL_VERSION};
use crate::Error;

/// Reads and validates a record header from `stream`.
///
/// A clean close before any byte of the header arrives is reported as
/// [`Error::ConnectionClosed`] rather than [`Error::Transport`] — the two
/// collapse to the same outcome under a plain `read_exact`, but a caller on
/// a long-running loop needs to tell "the peer hung up between records" (a
/// clean frame boundary) apart from "the peer died mid-record" (a genuine
/// transport failure).
pub async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Header, Error> {
    let mut buf = [0u8; Header::WIRE_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::Transport(format!("reading header: {e}")))?;
        if n == 0 {
            if filled == 0 {
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::Transport("peer closed mid-header".into()));
        }
        filled += n;
    }
    Header::decode(buf)
}

/// Reads exactly `header.len` bytes of body following a header already read
/// via [`read_header`].
pub async fn read_body<R: AsyncRead + Unpin>(stream: &mut R, header: Header) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; header.len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Transport(format!("reading body: {e}")))?;
    Ok(buf)
}

/// Writes a header followed by `body`, in one combined write so a receiver
/// never observes a torn record under normal stream semantics.
pub async fn write_record<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg_type: MsgType,
    body: &[u8],
) -> Result<(), Error> {
    let header = Header::new(msg_type, body.len() as u32)?;
    let mut buf = Vec::with_capacity(Header::WIRE_LEN + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    stream
        .write_all(&buf)
        .await
        .map_err(|e| Error::Transport(format!("writing record: {e}")))?;
    Ok(())
}

/// Sends our [`crate::message::PeerInfo`] and reads back the peer's,
/// failing with [`Error::IncompatibleVersion`] on a mismatch. Both sides of
/// every connection call this exactly once, immediately after connecting
/// (spec §4.1's `HELLO` exchange).
pub async fn exchange_hello<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), Error> {
    use crate::message::PeerInfo;

    write_record(stream, MsgType::Hello, &PeerInfo::ours().encode()).await?;
    let header = read_header(stream).await?;
    if header.msg_type != MsgType::Hello {
        return Err(Error::ProtocolViolation(format!(
            "expected HELLO, got {:?}",
            header.msg_type
        )));
    }
    let body = read_body(stream, header).await?;
    let peer = PeerInfo::decode(&body)?;
    if peer.version != PROTOCOL_VERSION {
        return Err(Error::IncompatibleVersion {
            peer: peer.version,
            ours: PROTOCOL_VERSION,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ExecParams;

    #[tokio::test]
    async fn roundtrips_a_record() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let params = ExecParams {
            connect_domain: 7,
            connect_port: 0,
        };
        write_record(&mut a, MsgType::ExecCmdline, &params.encode())
            .await
            .unwrap();
        let header = read_header(&mut b).await.unwrap();
        assert_eq!(header.msg_type, MsgType::ExecCmdline);
        assert_eq!(header.len as usize, ExecParams::WIRE_LEN);
        let body = read_body(&mut b, header).await.unwrap();
        let decoded = ExecParams::decode(&body).unwrap();
        assert_eq!(decoded, params);
    }

    #[tokio::test]
    async fn hello_exchange_succeeds_between_matching_peers() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let (ra, rb) = tokio::join!(exchange_hello(&mut a), exchange_hello(&mut b));
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn rejects_unknown_type_tag() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut raw = [0u8; Header::WIRE_LEN];
        raw[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        a.write_all(&raw).await.unwrap();
        let err = read_header(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn a_clean_close_at_a_frame_boundary_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(256);
        drop(a);
        let err = read_header(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn a_close_mid_header_is_a_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&[0u8; 3]).await.unwrap();
        drop(a);
        let err = read_header(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
