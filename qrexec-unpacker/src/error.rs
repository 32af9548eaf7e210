use thiserror::Error;

/// Errors from resolving credentials, preparing the chroot, or dropping
/// privileges.
#[derive(Debug, Error)]
pub enum Error {
    /// Neither a user name nor a numeric uid fallback resolved to a
    /// passwd entry.
    #[error("no such user: {0}")]
    UnknownUser(String),

    /// A privileged syscall (`setgid`, `initgroups`, `setfsuid`, `chdir`,
    /// `chroot`, `setuid`) failed.
    #[error("{op} failed: {source}")]
    Privilege {
        /// Name of the failing operation, for diagnostics.
        op: &'static str,
        /// Underlying OS error.
        source: nix::Error,
    },

    /// Underlying I/O failure (creating the incoming directory, querying
    /// free space).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
