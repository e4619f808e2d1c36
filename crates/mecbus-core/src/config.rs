//! Centralized configuration for the transport core.
//!
//! Socket paths are derived from one runtime directory: the directory
//! server listens on a single well-known path, and every client process
//! that accepts direct peer links listens on a path derived from its pid.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Protocol- and queue-level limits.
pub struct BusLimits;

impl BusLimits {
    /// Maximum payload size of one package.
    pub const MAX_PACKAGE_SIZE: usize = 4 * 1024 * 1024;

    /// Capacity of a connection's pending-write byte queue. Large
    /// enough that one maximum-size framed package always fits.
    pub const WRITE_QUEUE_CAPACITY: usize = 8 * 1024 * 1024;

    /// Chunk granularity of the pending-write byte queue.
    pub const WRITE_QUEUE_CHUNK_SIZE: usize = 16 * 1024;

    /// Read buffer size for one socket drain pass.
    pub const READ_CHUNK_SIZE: usize = 64 * 1024;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
    pub const SEND_DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const RETRIEVE_CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Poll interval while waiting for queue space in `send`.
    pub const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(10);
}

/// Filesystem layout of the runtime.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Directory holding all mecbus unix sockets.
    pub runtime_dir: PathBuf,
    /// Optional TCP listen port for cross-host peers.
    pub listen_port: Option<u16>,
}

impl BusConfig {
    const SERVER_SOCKET_NAME: &'static str = "mecbus-server.sock";

    /// Build a config rooted at the platform runtime directory
    /// (falls back to the temp dir when none is defined).
    pub fn new() -> Self {
        let base = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            runtime_dir: base.join("mecbus"),
            listen_port: None,
        }
    }

    /// Build a config rooted at an explicit directory (used by tests).
    pub fn with_runtime_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: dir.into(),
            listen_port: None,
        }
    }

    /// Well-known unix socket path of the directory server.
    pub fn server_socket_path(&self) -> PathBuf {
        self.runtime_dir.join(Self::SERVER_SOCKET_NAME)
    }

    /// Unix socket path a client loop listens on for direct peer
    /// links. `seq` disambiguates multiple loops in one process.
    pub fn peer_socket_path(&self, pid: u32, seq: u32) -> PathBuf {
        self.runtime_dir.join(format!("mecbus-peer.{pid}.{seq}.sock"))
    }

    /// Ensure the runtime directory exists.
    pub fn ensure_runtime_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.runtime_dir)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove a stale socket file left behind by a dead process.
pub fn remove_stale_socket(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_paths_derive_from_runtime_dir() {
        let cfg = BusConfig::with_runtime_dir("/tmp/mb-test");
        assert_eq!(
            cfg.server_socket_path(),
            PathBuf::from("/tmp/mb-test/mecbus-server.sock")
        );
        assert_eq!(
            cfg.peer_socket_path(42, 0),
            PathBuf::from("/tmp/mb-test/mecbus-peer.42.0.sock")
        );
    }
}
