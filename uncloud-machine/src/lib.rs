//! Machine lifecycle and cluster membership.
//!
//! - [`data_dir`]: on-disk layout of a machine's persistent state
//! - [`state`]: the persisted machine document (identity, key, roster)
//! - [`cluster`]: the in-memory membership store
//! - [`membership`]: Up/Suspect/Down transition tracking
//! - [`token`]: the Base58Check join token
//! - [`machine`]: the machine runtime: init/join/reset and loop wiring
//! - [`machine_service`], [`cluster_service`]: local backend gRPC services

pub mod cluster;
pub mod cluster_service;
pub mod data_dir;
pub mod error;
pub mod machine;
pub mod machine_service;
pub mod membership;
pub mod server;
pub mod state;
pub mod token;

pub use cluster::ClusterState;
pub use data_dir::DataDir;
pub use error::MachineError;
pub use machine::{Machine, PublicIpConfig};
pub use membership::MembershipTracker;
pub use server::BackendServer;
pub use state::MachineState;
pub use token::ClusterToken;
