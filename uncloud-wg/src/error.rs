//! Error types for the overlay control plane.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WgError {
    #[error("device error: {0}")]
    Device(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("network is already running")]
    AlreadyRunning,

    #[error("network is not configured, call configure first")]
    NotConfigured,

    #[error("network is still running, stop it before cleanup")]
    StillRunning,

    #[error("timeout notifying endpoint watcher")]
    WatchTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
