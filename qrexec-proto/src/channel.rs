//! The transport seam standing in for the real shared-ring channel.
//!
//! spec.md treats the underlying transport as an out-of-scope external
//! collaborator that is "byte-reliable, in-order, with a bounded send
//! buffer and a readiness file descriptor". This workspace implements that
//! contract over `UnixStream`, the same substitution the teacher workspace
//! already makes one layer down for its own guest transport (`bux::client::
//! Client` talks to the guest agent over a Unix socket standing in for a
//! vsock port). `send_space()` reports real send-buffer headroom via
//! `SO_SNDBUF`/`TIOCOUTQ`, so the backpressure invariant (spec §8 property
//!4) is exercised against a genuine bounded buffer rather than a constant.

use std::os::fd::AsRawFd;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

/// A byte-reliable, in-order, backpressure-aware duplex channel.
///
/// Implementors are assumed to buffer at most a bounded amount of unsent
/// data; [`Channel::send_space`] reports how much of that budget remains.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {
    /// Bytes of headroom currently available in the outbound send buffer.
    ///
    /// Callers (the daemon's backpressure gate, the client's stdin pump)
    /// treat `0` as "do not write more until this rises again".
    fn send_space(&self) -> std::io::Result<usize>;
}

impl Channel for UnixStream {
    fn send_space(&self) -> std::io::Result<usize> {
        raw_send_space(self.as_raw_fd())
    }
}

/// Queries send-buffer headroom directly on a raw fd, for callers that hold
/// only a split half or a bare fd rather than a value implementing
/// [`Channel`] — `OwnedWriteHalf` can't implement `Channel` itself since it
/// has no `AsyncRead` side, but the daemon's backpressure gate only ever
/// needs the send-space figure, not the full duplex interface.
pub fn raw_send_space(fd: std::os::fd::RawFd) -> std::io::Result<usize> {
    use nix::sys::socket::{getsockopt, sockopt::SndBuf};

    // SAFETY: callers guarantee `fd` is a valid, open socket fd for the
    // duration of this call.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let sndbuf = getsockopt(&borrowed, SndBuf)
        .map_err(|e| std::io::Error::other(format!("getsockopt(SO_SNDBUF): {e}")))? as usize;
    let queued = unsent_bytes(fd)?;
    Ok(sndbuf.saturating_sub(queued))
}

/// Queries how many bytes are still queued, unsent, in the socket's send
/// buffer, via `TIOCOUTQ` (Linux reports the socket send-queue length for
/// this ioctl on a `SOCK_STREAM`/`AF_UNIX` fd, same as for a TCP socket).
fn unsent_bytes(fd: std::os::fd::RawFd) -> std::io::Result<usize> {
    let mut queued: libc::c_int = 0;
    // SAFETY: `fd` is a valid, open socket fd and `queued` is a valid
    // pointer to a `c_int` the ioctl is documented to fill in.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, std::ptr::addr_of_mut!(queued)) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(queued.max(0) as usize)
}

/// Sets `SO_SNDBUF` to `bytes` on a connected Unix stream, establishing the
/// bounded send buffer [`Channel::send_space`] reports against. Daemons and
/// clients call this once, right after accepting or connecting.
pub fn set_send_buffer(stream: &UnixStream, bytes: usize) -> std::io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt::SndBuf};

    let fd = stream.as_raw_fd();
    // SAFETY: `fd` is `stream`'s own fd, valid for the duration of this call.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    setsockopt(&borrowed, SndBuf, &(bytes as libc::c_int))
        .map_err(|e| std::io::Error::other(format!("setsockopt(SO_SNDBUF): {e}")))
}

/// An in-memory bounded channel implementing [`Channel`], for deterministic
/// backpressure and framing tests that don't want real sockets.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

    use super::Channel;

    /// A `tokio::io::duplex` pair wrapped to implement [`Channel`], with a
    /// fixed, never-changing advertised send-buffer capacity (the duplex
    /// stream itself already enforces that bound).
    pub struct MemoryChannel {
        inner: DuplexStream,
        capacity: usize,
    }

    /// Builds a connected pair of in-memory channels, each with `capacity`
    /// bytes of internal buffer.
    #[must_use]
    pub fn pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            MemoryChannel { inner: a, capacity },
            MemoryChannel { inner: b, capacity },
        )
    }

    impl Channel for MemoryChannel {
        fn send_space(&self) -> std::io::Result<usize> {
            Ok(self.capacity)
        }
    }

    impl AsyncRead for MemoryChannel {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MemoryChannel {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        #[tokio::test]
        async fn echoes_bytes_between_pair() {
            let (mut a, mut b) = pair(64);
            a.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            b.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            assert_eq!(a.send_space().unwrap(), 64);
        }
    }
}
