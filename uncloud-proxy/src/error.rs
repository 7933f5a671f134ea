//! Error types for the proxy crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid backend address {0:?}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}
