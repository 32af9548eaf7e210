//! Trigger sandbox helper: the privilege-drop, chroot, and quota setup
//! `qrexec-daemon`'s policy-accepted file-copy triggers run before handing
//! off to the (out-of-scope, spec §1) unpack library.
//!
//! This crate implements exactly component 10 of spec.md's system
//! overview — nothing here loops over file entries or parses the transfer
//! wire format; [`unpack::Unpack`] is the seam the real unpack routine
//! plugs into.

pub mod error;
pub mod quota;
pub mod sandbox;
pub mod unpack;

pub use error::Error;
