//! Local CLI library for invoking qrexec services: handshake helpers, the
//! stdio pump, and the `-t`/`-T` escape filter.

mod error;
pub mod filter;
pub mod handshake;
pub mod pump;

pub use error::Error;
