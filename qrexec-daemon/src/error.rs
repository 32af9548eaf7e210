use thiserror::Error;

/// Errors produced by the daemon's port allocator, client registry, and
/// policy dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    /// The data-port space (spec §3: `DATA_PORT_BASE..DATA_PORT_MAX`) is
    /// fully allocated.
    #[error("no free data port available")]
    PortSpaceExhausted,

    /// A client tried to act from a state that does not permit it (e.g. a
    /// `SERVICE_CONNECT` from a client still in `Hello`).
    #[error("client on port {port} is in state {state:?}, which does not permit this operation")]
    InvalidClientState {
        /// The offending client's data port.
        port: u32,
        /// The client's actual state.
        state: crate::client::ClientState,
    },

    /// A `SERVICE_CONNECT` referenced a request identifier with no
    /// matching pending trigger.
    #[error("no pending trigger for request id {0:?}")]
    UnknownRequestId(String),

    /// The policy resolver process could not be spawned.
    #[error("spawning policy resolver: {0}")]
    PolicySpawn(std::io::Error),

    /// Protocol-level error from the wire codec or sanitiser.
    #[error(transparent)]
    Protocol(#[from] qrexec_proto::Error),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
