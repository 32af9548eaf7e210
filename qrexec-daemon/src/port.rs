//! Data-channel port allocation.
//!
//! Grounded in `qrexec-daemon.c`'s `allocate_vchan_port`/`release_vchan_port`:
//! port 512 is reserved for the control channel and is never handed out by
//! this allocator; data channels get the next free port starting at 513,
//! wrapping back to the bottom of the range once the top is reached. Each
//! in-use port records the remote domid it was allocated for, the same way
//! the original's `used_vchan_ports[]` array stores the owning domain —
//! `release` only frees a port back to the pool when the caller's domid
//! matches what's on record, so one domain's stale or forged release can
//! never evict another's live connection.
//!
//! The original scans a fixed-size `clients[]` table for a hole; here a
//! `HashMap` of in-use ports serves the same purpose without the fixed
//! upper bound on concurrent clients that a C array forces.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::Error;

/// The control channel's fixed port. Never returned by [`PortAllocator`].
pub const CTRL_PORT: u32 = 512;

/// First port handed out for data channels.
pub const DATA_PORT_BASE: u32 = 513;

/// One past the last port handed out for data channels. The original's
/// vchan port space is small enough that a daemon realistically never
/// approaches this; it exists so allocation is provably bounded rather
/// than growing without limit.
pub const DATA_PORT_MAX: u32 = 1024;

/// Hands out and reclaims data-channel port numbers in `DATA_PORT_BASE..
/// DATA_PORT_MAX`, always returning the lowest free port (matching the
/// original's linear scan-from-bottom behaviour, which callers rely on for
/// deterministic port numbers in logs), and remembering which remote domid
/// each in-use port was allocated for.
#[derive(Debug, Default)]
pub struct PortAllocator {
    in_use: HashMap<u32, i32>,
}

impl PortAllocator {
    /// Builds an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the lowest free port for `remote_domid`, or
    /// [`Error::PortSpaceExhausted`] if the whole range is taken.
    pub fn allocate(&mut self, remote_domid: i32) -> Result<u32, Error> {
        for port in DATA_PORT_BASE..DATA_PORT_MAX {
            if let Entry::Vacant(slot) = self.in_use.entry(port) {
                slot.insert(remote_domid);
                return Ok(port);
            }
        }
        Err(Error::PortSpaceExhausted)
    }

    /// Reserves a specific port (a client-requested `connect_port != 0`)
    /// for `remote_domid`, failing if it is already in use or outside the
    /// valid range.
    pub fn reserve(&mut self, port: u32, remote_domid: i32) -> Result<(), Error> {
        if !(DATA_PORT_BASE..DATA_PORT_MAX).contains(&port) {
            return Err(Error::PortSpaceExhausted);
        }
        match self.in_use.entry(port) {
            Entry::Vacant(slot) => {
                slot.insert(remote_domid);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::PortSpaceExhausted),
        }
    }

    /// Returns `port` to the free pool, but only if it is currently
    /// recorded as owned by `expected_remote_domid` — matching
    /// `release_vchan_port`'s own domid check. Returns whether the port was
    /// actually released; a release of a port that was never allocated, or
    /// whose owner doesn't match, is a silent no-op, the same tolerance the
    /// original shows toward redundant or stale `release_vchan_port` calls
    /// during teardown races.
    pub fn release(&mut self, port: u32, expected_remote_domid: i32) -> bool {
        if self.in_use.get(&port) == Some(&expected_remote_domid) {
            self.in_use.remove(&port);
            true
        } else {
            false
        }
    }

    /// Number of ports currently allocated.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port_first() {
        let mut alloc = PortAllocator::new();
        assert_eq!(alloc.allocate(1).unwrap(), DATA_PORT_BASE);
        assert_eq!(alloc.allocate(1).unwrap(), DATA_PORT_BASE + 1);
        alloc.release(DATA_PORT_BASE, 1);
        assert_eq!(alloc.allocate(1).unwrap(), DATA_PORT_BASE);
    }

    #[test]
    fn never_hands_out_the_control_port() {
        let mut alloc = PortAllocator::new();
        for _ in DATA_PORT_BASE..DATA_PORT_MAX {
            let port = alloc.allocate(1).unwrap();
            assert_ne!(port, CTRL_PORT);
        }
    }

    #[test]
    fn exhausts_the_port_space() {
        let mut alloc = PortAllocator::new();
        for _ in DATA_PORT_BASE..DATA_PORT_MAX {
            alloc.allocate(1).unwrap();
        }
        assert!(matches!(alloc.allocate(1), Err(Error::PortSpaceExhausted)));
    }

    #[test]
    fn reserve_rejects_an_in_use_port() {
        let mut alloc = PortAllocator::new();
        alloc.reserve(600, 1).unwrap();
        assert!(alloc.reserve(600, 2).is_err());
    }

    #[test]
    fn reserve_rejects_the_control_port() {
        let mut alloc = PortAllocator::new();
        assert!(alloc.reserve(CTRL_PORT, 1).is_err());
    }

    #[test]
    fn release_of_unallocated_port_is_a_no_op() {
        let mut alloc = PortAllocator::new();
        assert!(!alloc.release(999, 1));
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn release_no_ops_when_the_domid_does_not_match() {
        let mut alloc = PortAllocator::new();
        let port = alloc.allocate(1).unwrap();
        assert!(!alloc.release(port, 2));
        assert_eq!(alloc.allocated_count(), 1);
        assert!(alloc.release(port, 1));
        assert_eq!(alloc.allocated_count(), 0);
    }
}
