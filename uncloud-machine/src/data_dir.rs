//! Data directory management
//!
//! On-disk layout of a machine's persistent state:
//! - `machine.key`: Curve25519 tunnel private key
//! - `machine.json`: identity, network config, and last-known roster
//! - `machine.sock`: internal socket of the local gRPC backend
//! - `uncloud.sock`: public socket of the request proxy

use std::path::{Path, PathBuf};

/// Default base directory for the machine daemon.
pub const DEFAULT_BASE: &str = "/var/lib/uncloud";

#[derive(Debug, Clone)]
pub struct DataDir {
    base: PathBuf,
}

impl DataDir {
    /// Create a DataDir with a custom base path.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Get the base directory path.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path to the tunnel private key file.
    pub fn key_file(&self) -> PathBuf {
        self.base.join("machine.key")
    }

    /// Path to the persisted machine state document.
    pub fn state_file(&self) -> PathBuf {
        self.base.join("machine.json")
    }

    /// Path to the internal socket the local backend serves on.
    pub fn backend_sock(&self) -> PathBuf {
        self.base.join("machine.sock")
    }

    /// Path to the public socket the proxy serves on.
    pub fn proxy_sock(&self) -> PathBuf {
        self.base.join("uncloud.sock")
    }

    /// Ensure the base directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)
    }
}

impl Default for DataDir {
    fn default() -> Self {
        Self::new(DEFAULT_BASE)
    }
}
