//! Pairs the two sides of a data channel (a local client connection and
//! the agent's corresponding data connection) by port number.
//!
//! Whichever side arrives first registers and waits; the second arrival
//! hands its stream straight to the first via a one-shot channel. This
//! stands in for the original's single vchan port meaning "the same
//! logical pipe from both ends" — here each side is a distinct `UnixStream`
//! that must be explicitly introduced to its counterpart.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::net::UnixStream;
use tokio::sync::oneshot;

/// Table of data channels awaiting their second half, keyed by port.
#[derive(Default)]
pub struct Rendezvous {
    waiting: Mutex<HashMap<u32, oneshot::Sender<UnixStream>>>,
}

impl Rendezvous {
    /// Builds an empty rendezvous table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the data channel for `port` with `stream`.
    ///
    /// If another side is already waiting on `port`, hands `stream`
    /// straight to it and returns `None` — that earlier caller now owns
    /// both ends and relays them; this side has nothing further to do.
    /// If no one is waiting yet, registers a wait for a peer and returns
    /// `stream` back together with a receiver that resolves once a second
    /// stream joins — the caller keeps its own stream and, once `rx`
    /// resolves, relays it against the peer.
    pub fn join(&self, port: u32, stream: UnixStream) -> Option<(UnixStream, oneshot::Receiver<UnixStream>)> {
        let mut waiting = self.waiting.lock().expect("rendezvous mutex poisoned");
        if let Some(sender) = waiting.remove(&port) {
            let _ = sender.send(stream);
            None
        } else {
            let (tx, rx) = oneshot::channel();
            waiting.insert(port, tx);
            Some((stream, rx))
        }
    }

    /// Drops any waiter registered for `port` without pairing it,
    /// e.g. because the original request was torn down before a peer
    /// arrived.
    pub fn cancel(&self, port: u32) {
        self.waiting.lock().expect("rendezvous mutex poisoned").remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn second_arrival_completes_the_first_arrivals_wait() {
        let rendezvous = Rendezvous::new();
        let (a, mut a_peer) = UnixStream::pair().unwrap();
        let (b, mut b_peer) = UnixStream::pair().unwrap();

        let (mut kept_a, rx) = rendezvous.join(600, a).expect("first arrival should wait");
        assert!(rendezvous.join(600, b).is_none());

        let mut paired_with_b = rx.await.unwrap();
        paired_with_b.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        kept_a.write_all(b"ok").await.unwrap();
        let mut buf2 = [0u8; 2];
        a_peer.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"ok");
    }

    #[tokio::test]
    async fn cancel_removes_a_waiter() {
        let rendezvous = Rendezvous::new();
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let _rx = rendezvous.join(600, a);
        rendezvous.cancel(600);
        let (b, _b_peer) = UnixStream::pair().unwrap();
        assert!(rendezvous.join(600, b).is_some());
    }
}
