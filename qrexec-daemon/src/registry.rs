//! The daemon's client registry: the single owner of port-to-client state.
//!
//! Everything in here is plain, synchronous, single-owner state — no
//! locks, per spec §5 ("no locks required ... single-threaded"). It is
//! only ever touched from the central event loop task in
//! [`crate::event_loop`]; per-connection tasks never see it directly.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::client::ClientEntry;
use crate::error::Error;
use crate::port::PortAllocator;

/// Owns the port allocator, the table of live client entries, and the
/// notify-on-close handle each running client hands back once paired —
/// the `vchan_port_notify_client[]` array `release_vchan_port` consults in
/// the original, reimplemented as a one-shot signal instead of a raw fd
/// close since a connection task here owns its own socket.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    ports: PortAllocator,
    clients: HashMap<u32, ClientEntry>,
    notify: HashMap<u32, oneshot::Sender<()>>,
}

impl ClientRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh data port and registers a new client entry for
    /// `peer_domain` on it.
    pub fn register(&mut self, peer_domain: i32) -> Result<u32, Error> {
        let port = self.ports.allocate(peer_domain)?;
        self.clients.insert(port, ClientEntry::new(port, peer_domain));
        Ok(port)
    }

    /// Registers a new client entry on a specific, client-requested port.
    pub fn register_on_port(&mut self, port: u32, peer_domain: i32) -> Result<(), Error> {
        self.ports.reserve(port, peer_domain)?;
        self.clients.insert(port, ClientEntry::new(port, peer_domain));
        Ok(())
    }

    /// Looks up a client's entry by its data port.
    #[must_use]
    pub fn get(&self, port: u32) -> Option<&ClientEntry> {
        self.clients.get(&port)
    }

    /// Mutably looks up a client's entry by its data port.
    pub fn get_mut(&mut self, port: u32) -> Option<&mut ClientEntry> {
        self.clients.get_mut(&port)
    }

    /// Records the handle a now-running connection task hands back: firing
    /// it later asks that task to drop its stream and stop forwarding,
    /// without this registry ever touching the socket itself.
    pub fn set_notify(&mut self, port: u32, terminate: oneshot::Sender<()>) {
        self.notify.insert(port, terminate);
    }

    /// Tears down and removes a client's entry, releasing its port back to
    /// the allocator and signalling its connection task to close — but only
    /// if `port` is currently owned by `expected_remote_domid` (spec §4.3,
    /// §8 property 1). A release that doesn't match the port's recorded
    /// owner leaves the live client and its port alone.
    pub fn remove(&mut self, port: u32, expected_remote_domid: i32) {
        if !self.ports.release(port, expected_remote_domid) {
            return;
        }
        if let Some(mut entry) = self.clients.remove(&port) {
            entry.invalidate();
        }
        if let Some(terminate) = self.notify.remove(&port) {
            let _ = terminate.send(());
        }
    }

    /// Number of live client entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry currently holds no clients.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove_round_trips_the_port() {
        let mut registry = ClientRegistry::new();
        let port = registry.register(5).unwrap();
        assert!(registry.get(port).is_some());
        registry.remove(port, 5);
        assert!(registry.get(port).is_none());
        // the port should be reusable after release
        let reused = registry.register(5).unwrap();
        assert_eq!(reused, port);
    }

    #[test]
    fn remove_with_the_wrong_domain_is_a_no_op() {
        let mut registry = ClientRegistry::new();
        let port = registry.register(5).unwrap();
        registry.remove(port, 6);
        assert!(registry.get(port).is_some());
        registry.remove(port, 5);
        assert!(registry.get(port).is_none());
    }

    #[test]
    fn register_on_port_rejects_a_taken_port() {
        let mut registry = ClientRegistry::new();
        registry.register_on_port(600, 1).unwrap();
        assert!(registry.register_on_port(600, 2).is_err());
    }

    #[test]
    fn remove_of_unknown_port_does_not_panic() {
        let mut registry = ClientRegistry::new();
        registry.remove(999, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_signals_the_recorded_notify_handle() {
        let mut registry = ClientRegistry::new();
        let port = registry.register(5).unwrap();
        let (tx, rx) = oneshot::channel();
        registry.set_notify(port, tx);
        registry.remove(port, 5);
        assert!(rx.try_recv().is_ok());
    }
}
