use thiserror::Error;

/// Errors produced by the client's handshake, pump, and CLI layers.
#[derive(Debug, Error)]
pub enum Error {
    /// The data-channel connection did not complete within the configured
    /// timeout (spec §6's `-w timeout`, default 5s).
    #[error("connection to the target timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Protocol-level error from the wire codec or sanitiser.
    #[error(transparent)]
    Protocol(#[from] qrexec_proto::Error),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
