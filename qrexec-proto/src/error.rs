use thiserror::Error;

/// Errors produced by the wire codec, the sanitiser, and the transport seam.
#[derive(Debug, Error)]
pub enum Error {
    /// A peer's protocol version does not match ours (spec §4.1).
    #[error("incompatible protocol version: peer speaks {peer}, we speak {ours}")]
    IncompatibleVersion {
        /// Version advertised by the remote peer.
        peer: u32,
        /// Version this crate speaks.
        ours: u32,
    },

    /// A record violated the wire format: bad type tag, wrong length, or a
    /// field that fails to decode as expected.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The transport (control channel, data channel, or local socket)
    /// failed below the protocol layer: closed, reset, or I/O error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection cleanly at a frame boundary — zero
    /// bytes arrived where a header was expected. Distinct from
    /// `Transport`, which covers a genuine I/O failure or a close that cut
    /// a record in half; a long-running read loop (the data-channel relay,
    /// the agent control channel) can treat this as ordinary teardown
    /// rather than a failure worth logging.
    #[error("peer closed the connection")]
    ConnectionClosed,

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
