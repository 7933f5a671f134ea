//! Error types for machine lifecycle and membership operations.

use thiserror::Error;
use uncloud_model::MachineId;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("machine is already initialized")]
    AlreadyInitialized,

    #[error("machine is not initialized")]
    NotInitialized,

    #[error("machine not found: {0}")]
    NotFound(MachineId),

    #[error("cannot remove the local machine; reset it instead")]
    RemoveSelf,

    #[error("allocated public key does not match this machine's key")]
    KeyMismatch,

    #[error("invalid cluster network {0:?}")]
    InvalidNetwork(String),

    #[error("network error: {0}")]
    Network(#[from] uncloud_model::NetworkError),

    #[error("tunnel error: {0}")]
    Wg(#[from] uncloud_wg::WgError),

    #[error("key error: {0}")]
    Key(#[from] uncloud_model::keypair::KeyError),

    #[error("conversion error: {0}")]
    Convert(#[from] uncloud_api::ConvertError),

    #[error("state persistence error: {0}")]
    State(String),

    #[error("invalid token: {0}")]
    Token(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MachineError> for tonic::Status {
    fn from(err: MachineError) -> Self {
        match &err {
            MachineError::AlreadyInitialized | MachineError::NotInitialized => {
                tonic::Status::failed_precondition(err.to_string())
            }
            MachineError::NotFound(_) => tonic::Status::not_found(err.to_string()),
            MachineError::RemoveSelf
            | MachineError::KeyMismatch
            | MachineError::InvalidNetwork(_)
            | MachineError::Network(_)
            | MachineError::Convert(_)
            | MachineError::Token(_) => tonic::Status::invalid_argument(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}
