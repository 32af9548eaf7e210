//! Wire protocol, sanitiser, and transport seam shared by the qrexec
//! daemon, client, and unpacker.
//!
//! This crate owns everything that both sides of a connection must agree
//! on byte-for-byte: the fixed-layout [`message`] records, the [`codec`]
//! that frames them onto a stream, the [`sanitize`] seam that is the only
//! legal path from agent-originated bytes to a trusted `String`, and the
//! [`channel`] transport trait the daemon and client build their I/O on.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod codec;
mod error;
pub mod message;
pub mod sanitize;

pub use codec::{exchange_hello, read_body, read_header, write_record};
pub use error::Error;
pub use message::{
    decode_exec_request, encode_exec_request, ExecParams, Header, MsgType, PeerInfo, RawTriggerServiceParams,
    ServiceParams, MAX_DATA_CHUNK, PROTOCOL_VERSION,
};
pub use sanitize::{sanitize_field, FieldKind, Sanitized, TriggerServiceParams, Untrusted};
