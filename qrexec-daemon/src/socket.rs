//! The daemon's local Unix socket and its numeric-alias symlink.
//!
//! Grounded in `qrexec-daemon.c`'s `create_qrexec_socket`: `qrexec-client`
//! connects to `/var/run/qubes/qrexec.<domain-name>`, and a symlink
//! `qrexec.<domid>` next to it lets a caller that only knows the numeric
//! domain id find the same socket.

use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

/// Default directory the daemon's local sockets live in.
pub const SOCKET_DIR: &str = "/var/run/qubes";

/// Paths for one daemon instance's local socket and its alias symlink.
#[derive(Debug, Clone)]
pub struct SocketPaths {
    /// The real socket path, named by domain name.
    pub socket: PathBuf,
    /// A symlink to `socket`, named by numeric domain id.
    pub alias: PathBuf,
}

impl SocketPaths {
    /// Builds the conventional paths for `domid`/`domain_name` under `dir`.
    #[must_use]
    pub fn new(dir: &Path, domid: u32, domain_name: &str) -> Self {
        Self {
            socket: dir.join(format!("qrexec.{domain_name}")),
            alias: dir.join(format!("qrexec.{domid}")),
        }
    }

    /// Removes any stale socket file and symlink before binding, matching
    /// the original's "unlink then bind" startup sequence.
    pub fn clean(&self) -> std::io::Result<()> {
        for path in [&self.socket, &self.alias] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Binds the real socket and creates the alias symlink pointing at it.
    pub fn bind(&self) -> std::io::Result<UnixListener> {
        self.clean()?;
        if let Some(parent) = self.socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket)?;
        std::os::unix::fs::symlink(&self.socket, &self.alias)?;
        Ok(listener)
    }

    /// Removes both the socket and the symlink, for shutdown cleanup.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.alias);
        let _ = std::fs::remove_file(&self.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_creates_socket_and_alias_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), 7, "work");
        let _listener = paths.bind().unwrap();
        assert!(paths.socket.exists());
        let resolved = std::fs::read_link(&paths.alias).unwrap();
        assert_eq!(resolved, paths.socket);
        paths.remove();
        assert!(!paths.socket.exists());
        assert!(std::fs::symlink_metadata(&paths.alias).is_err());
    }

    #[test]
    fn bind_is_idempotent_over_a_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), 7, "work");
        {
            let _first = paths.bind().unwrap();
        }
        let _second = paths.bind().unwrap();
        paths.remove();
    }
}
